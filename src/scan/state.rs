//! Scan lifecycle states and outcomes.

use crate::device::DeviceId;
use crate::health::HealthReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Orchestrator lifecycle state.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Connecting ──> Provisioning ──> Running
///  ▲                  │               │              │
///  │                  │ (declined)    │ (failure)    ├──> Completing ─┐
///  ├──────────────────┘               │              ├──> Aborting  ──┤
///  │                                  └──────────────┼──> Parking   ──┤
///  │                                                 └──> Stopping  ──┤
///  └──────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanState {
    /// No session; ready to start
    #[default]
    Idle,
    /// Checking device connections
    Connecting,
    /// Subscribing monitors and commanding devices
    Provisioning,
    /// Scan in progress
    Running,
    /// Every device reached its terminal count; tearing down
    Completing,
    /// Aborted by operator or failure; tearing down
    Aborting,
    /// Parking actuators; tearing down
    Parking,
    /// Stopping actuators; tearing down
    Stopping,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "Idle"),
            ScanState::Connecting => write!(f, "Connecting"),
            ScanState::Provisioning => write!(f, "Provisioning"),
            ScanState::Running => write!(f, "Running"),
            ScanState::Completing => write!(f, "Completing"),
            ScanState::Aborting => write!(f, "Aborting"),
            ScanState::Parking => write!(f, "Parking"),
            ScanState::Stopping => write!(f, "Stopping"),
        }
    }
}

impl ScanState {
    /// Check if a new session may start.
    pub fn can_start(&self) -> bool {
        matches!(self, ScanState::Idle)
    }

    /// Check if an abort request has an effect.
    pub fn can_abort(&self) -> bool {
        matches!(
            self,
            ScanState::Connecting | ScanState::Provisioning | ScanState::Running
        )
    }

    /// Check if the session is tearing down.
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            ScanState::Completing | ScanState::Aborting | ScanState::Parking | ScanState::Stopping
        )
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    /// Every device reached its terminal count
    Completed,
    /// Aborted by the operator, a device failure, or a provisioning failure
    Aborted,
    /// Actuators parked on request
    Parked,
    /// Actuators stopped on request
    Stopped,
    /// Ended during connection checking without touching any device
    Terminated,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeKind::Completed => write!(f, "completed"),
            OutcomeKind::Aborted => write!(f, "aborted"),
            OutcomeKind::Parked => write!(f, "parked"),
            OutcomeKind::Stopped => write!(f, "stopped"),
            OutcomeKind::Terminated => write!(f, "terminated"),
        }
    }
}

/// Record of a finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// Session identifier
    pub session_id: Uuid,
    /// How the session ended
    pub kind: OutcomeKind,
    /// Human readable status message (also sent to listeners)
    pub message: String,
    /// When teardown finished
    pub finished_at: DateTime<Utc>,
}

/// Result of [`ScanOrchestrator::start`](super::ScanOrchestrator::start).
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// Devices commanded; the session is running
    Started {
        /// Session identifier
        session_id: Uuid,
        /// Devices taking part
        devices: Vec<DeviceId>,
        /// Final health report (after retry)
        health: HealthReport,
    },
    /// Ended during connection checking (declined or no healthy device)
    Terminated {
        /// Status message
        reason: String,
        /// Health report, if the check ran
        health: Option<HealthReport>,
    },
    /// Aborted before reaching `Running`
    Aborted {
        /// Status message
        reason: String,
    },
}

impl StartOutcome {
    /// Whether the session reached `Running`.
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(ScanState::Idle.can_start());
        assert!(!ScanState::Running.can_start());
        assert!(!ScanState::Aborting.can_start());

        assert!(ScanState::Connecting.can_abort());
        assert!(ScanState::Provisioning.can_abort());
        assert!(ScanState::Running.can_abort());
        assert!(!ScanState::Idle.can_abort());
        assert!(!ScanState::Completing.can_abort());

        assert!(ScanState::Parking.is_terminating());
        assert!(!ScanState::Running.is_terminating());
    }

    #[test]
    fn test_display() {
        assert_eq!(ScanState::Provisioning.to_string(), "Provisioning");
        assert_eq!(OutcomeKind::Parked.to_string(), "parked");
    }
}
