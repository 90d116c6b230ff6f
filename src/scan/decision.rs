//! Operator decisions requested during scan start.

use crate::device::Device;
use crate::health::HealthReport;
use async_trait::async_trait;

/// Answers the questions the orchestrator asks before touching devices.
#[async_trait]
pub trait ContinueDecision: Send + Sync {
    /// Some devices stayed unhealthy after the re-check. Return `true` to scan
    /// with the healthy subset.
    async fn continue_with_unhealthy(&self, report: &HealthReport) -> bool;

    /// The scan is about to overwrite device settings with defaults.
    async fn confirm_destructive(&self, _devices: &[Device]) -> bool {
        true
    }
}

/// Always proceed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysContinue;

#[async_trait]
impl ContinueDecision for AlwaysContinue {
    async fn continue_with_unhealthy(&self, _report: &HealthReport) -> bool {
        true
    }
}

/// Never proceed with unhealthy devices or destructive parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverContinue;

#[async_trait]
impl ContinueDecision for NeverContinue {
    async fn continue_with_unhealthy(&self, _report: &HealthReport) -> bool {
        false
    }

    async fn confirm_destructive(&self, _devices: &[Device]) -> bool {
        false
    }
}
