//! # Wire Scan Orchestrator
//!
//! Coordinates beam-profile measurements across a set of remotely controlled
//! devices: profile scanners that drive a wire through the beam, and wire
//! harps that sample a fixed wire array. One scan session runs at a time.
//!
//! ## Crate Structure
//!
//! - **`channel`**: The [`RemoteChannel`](channel::RemoteChannel) contract for
//!   named process values, plus an in-memory mock used by tests and the
//!   simulator.
//! - **`device`**: Device identity, channel layout and capability queries.
//! - **`health`**: Connection health checks with retry classification.
//! - **`monitor`**: A pool of channel subscriptions started and stopped as a unit.
//! - **`progress`**: Per-device progress and motion tracking.
//! - **`averager`**: Exponentially weighted running averages of sample streams.
//! - **`scan`**: The [`ScanOrchestrator`](scan::ScanOrchestrator) state machine,
//!   requests, listeners and operator decision hooks.
//! - **`config`**: Layered configuration (defaults, TOML file, environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: Crate error types.

pub mod averager;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod health;
pub mod logging;
pub mod monitor;
pub mod progress;
pub mod scan;

pub use error::{AppResult, ChannelError, ScanError};
pub use scan::{ScanOrchestrator, ScanRequest, ScanState};
