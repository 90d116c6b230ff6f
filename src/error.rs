//! Custom error types for the scan orchestrator.
//!
//! This module defines the two error enums used across the crate. Both are built
//! with `thiserror`, so they compose with the `?` operator and convert into each
//! other where a channel failure bubbles up into a scan failure.
//!
//! ## Error Hierarchy
//!
//! - **`ChannelError`**: failures reported by a [`RemoteChannel`](crate::channel::RemoteChannel)
//!   implementation. `Unreachable` and `Timeout` are recoverable (the health check
//!   retries them); `BadChannel` means the name does not resolve to an endpoint at
//!   all and excludes the device without retry.
//! - **`ScanError`**: everything the orchestrator can reject or fail with:
//!   invalid requests, a busy orchestrator, unsupported device operations,
//!   monitor teardown failures, and configuration problems.

use crate::scan::ScanState;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the orchestrator error type.
pub type AppResult<T> = std::result::Result<T, ScanError>;

/// Failure reported by the remote channel layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Channel '{name}' unreachable: {reason}")]
    Unreachable { name: String, reason: String },

    #[error("Channel '{name}' did not connect within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Channel '{0}' does not resolve to an endpoint")]
    BadChannel(String),

    #[error("Write to '{name}' failed: {reason}")]
    Write { name: String, reason: String },

    #[error("Read from '{name}' failed: {reason}")]
    Read { name: String, reason: String },

    #[error("Subscription to '{name}' failed: {reason}")]
    Subscribe { name: String, reason: String },
}

impl ChannelError {
    /// Whether a later connection attempt may succeed.
    ///
    /// Bad channel names never resolve, so they are excluded from automatic
    /// retries.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChannelError::BadChannel(_))
    }

    /// Name of the channel the failure refers to.
    pub fn channel_name(&self) -> &str {
        match self {
            ChannelError::Unreachable { name, .. }
            | ChannelError::Timeout { name, .. }
            | ChannelError::Write { name, .. }
            | ChannelError::Read { name, .. }
            | ChannelError::Subscribe { name, .. } => name,
            ChannelError::BadChannel(name) => name,
        }
    }
}

/// Errors raised by the orchestrator and its components.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("Orchestrator is busy (state: {0})")]
    Busy(ScanState),

    #[error("A single acquisition is in progress")]
    Acquiring,

    #[error("No scan is running")]
    NotRunning,

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Cannot add a subscription to a running monitor pool")]
    PoolRunning,

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Teardown incomplete: {} channel(s) failed to release", .0.len())]
    TeardownFailed(Vec<ChannelError>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ScanError {
    fn from(err: figment::Error) -> Self {
        ScanError::Figment(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChannelError::BadChannel("WS01:Bogus".to_string());
        assert_eq!(
            err.to_string(),
            "Channel 'WS01:Bogus' does not resolve to an endpoint"
        );

        let err = ScanError::InvalidRequest("empty device set".into());
        assert_eq!(err.to_string(), "Invalid scan request: empty device set");

        assert_eq!(
            ScanError::Acquiring.to_string(),
            "A single acquisition is in progress"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!ChannelError::BadChannel("x".into()).is_retryable());
        assert!(ChannelError::Timeout {
            name: "x".into(),
            timeout: Duration::from_millis(10),
        }
        .is_retryable());
        assert!(ChannelError::Unreachable {
            name: "x".into(),
            reason: "refused".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_channel_error_converts_into_scan_error() {
        let err: ScanError = ChannelError::Write {
            name: "WS01:Cmd".into(),
            reason: "nack".into(),
        }
        .into();
        assert!(matches!(err, ScanError::Channel(_)));
        assert!(err.to_string().contains("WS01:Cmd"));
    }
}
