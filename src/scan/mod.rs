//! Scan orchestration.
//!
//! [`ScanOrchestrator`] owns the lifecycle of a scan session. Requests are
//! described by [`ScanRequest`]; progress and outcomes are reported to
//! registered [`ScanListener`]s and published through a state watch channel.

mod decision;
mod listener;
mod orchestrator;
mod request;
mod session;
mod state;

pub use decision::{AlwaysContinue, ContinueDecision, NeverContinue};
pub use listener::{ListenerId, ListenerRegistry, ScanListener};
pub use orchestrator::{AcquireReport, AcquiredSample, ScanOrchestrator};
pub use request::{AcquisitionMode, ParameterMode, ScanMode, ScanRequest};
pub use state::{OutcomeKind, ScanOutcome, ScanState, StartOutcome};
