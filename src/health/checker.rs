//! Connection health checker
//!
//! Attempts to connect every required channel of every device within a timeout.
//! The check only observes: handles are dropped once connected and no device
//! state is written.
//!
//! Failures are classified by [`ChannelError::is_retryable`]:
//! - unreachable or slow endpoints may recover and are offered for re-check,
//! - channel names that do not resolve exclude the device without retry.

use crate::channel::{connect_within, RemoteChannel};
use crate::device::{Device, DeviceId};
use crate::error::ChannelError;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a health check.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Every checked device, in request order
    pub checked: Vec<Device>,
    /// Devices whose required channels all connected, in request order
    pub healthy: Vec<Device>,
    /// Devices with at least one failed channel, in request order
    pub unhealthy: Vec<Device>,
    /// Channel failures per unhealthy device
    pub failures: HashMap<DeviceId, Vec<ChannelError>>,
    /// When the check finished
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Whether every checked device is healthy.
    pub fn all_healthy(&self) -> bool {
        self.unhealthy.is_empty()
    }

    /// Unhealthy devices whose failures are all retryable.
    pub fn retryable(&self) -> Vec<Device> {
        self.unhealthy
            .iter()
            .filter(|device| {
                self.failures
                    .get(device.id())
                    .map_or(true, |errors| errors.iter().all(ChannelError::is_retryable))
            })
            .cloned()
            .collect()
    }

    /// Unhealthy devices with at least one channel that does not resolve.
    pub fn excluded(&self) -> Vec<Device> {
        self.unhealthy
            .iter()
            .filter(|device| {
                self.failures
                    .get(device.id())
                    .is_some_and(|errors| errors.iter().any(|e| !e.is_retryable()))
            })
            .cloned()
            .collect()
    }

    /// Failures recorded for one device.
    pub fn failures_for(&self, device: &DeviceId) -> &[ChannelError] {
        self.failures.get(device).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fold a re-check of some devices into this report.
    ///
    /// Devices present in `recheck` take their new classification; everything
    /// else keeps its original one. Both lists stay in request order.
    pub fn merge(mut self, recheck: HealthReport) -> HealthReport {
        for device in &recheck.checked {
            self.failures.remove(device.id());
            if !self.checked.contains(device) {
                self.checked.push(device.clone());
            }
        }
        self.failures.extend(recheck.failures);

        let (healthy, unhealthy): (Vec<Device>, Vec<Device>) = self
            .checked
            .iter()
            .cloned()
            .partition(|device| !self.failures.contains_key(device.id()));
        self.healthy = healthy;
        self.unhealthy = unhealthy;
        self.checked_at = recheck.checked_at;
        self
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        if self.all_healthy() {
            return format!("{} device(s) healthy", self.healthy.len());
        }
        let names: Vec<String> = self.unhealthy.iter().map(|d| d.id().to_string()).collect();
        format!(
            "{} healthy, {} unhealthy: {}",
            self.healthy.len(),
            self.unhealthy.len(),
            names.join(", ")
        )
    }
}

/// Checks that devices' required channels are reachable.
#[derive(Clone)]
pub struct ConnectionHealthChecker {
    remote: Arc<dyn RemoteChannel>,
}

impl ConnectionHealthChecker {
    /// Create a checker over a remote channel layer.
    pub fn new(remote: Arc<dyn RemoteChannel>) -> Self {
        Self { remote }
    }

    /// Check every device concurrently.
    ///
    /// Blocks the caller for at most about `timeout`; never returns an error.
    pub async fn check(&self, devices: &[Device], timeout: Duration) -> HealthReport {
        let results = join_all(
            devices
                .iter()
                .map(|device| self.check_device(device, timeout)),
        )
        .await;

        let mut report = HealthReport {
            checked: devices.to_vec(),
            healthy: Vec::new(),
            unhealthy: Vec::new(),
            failures: HashMap::new(),
            checked_at: Utc::now(),
        };

        for (device, errors) in devices.iter().zip(results) {
            if errors.is_empty() {
                report.healthy.push(device.clone());
            } else {
                for error in &errors {
                    warn!(
                        device = %device.id(),
                        channel = error.channel_name(),
                        "Health check failed: {}",
                        error
                    );
                }
                report.unhealthy.push(device.clone());
                report.failures.insert(device.id().clone(), errors);
            }
        }

        debug!("Health check finished: {}", report.summary());
        report
    }

    async fn check_device(&self, device: &Device, timeout: Duration) -> Vec<ChannelError> {
        let remote = self.remote.as_ref();
        let attempts = device
            .required_channels()
            .into_iter()
            .map(|name| connect_within(remote, name, timeout));

        join_all(attempts)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockRemote;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn setup(ids: &[&str]) -> (MockRemote, Vec<Device>) {
        let devices: Vec<Device> = ids.iter().map(|id| Device::profile_scanner(*id)).collect();
        let remote = MockRemote::with_devices(&devices);
        (remote, devices)
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let (remote, devices) = setup(&["A", "B"]);
        let checker = ConnectionHealthChecker::new(Arc::new(remote));

        let report = checker.check(&devices, TIMEOUT).await;
        assert!(report.all_healthy());
        assert_eq!(report.healthy, devices);
    }

    #[tokio::test]
    async fn test_unreachable_device_is_retryable() {
        let (remote, devices) = setup(&["A", "B"]);
        remote.set_unreachable(&devices[1].channels().motion, true);
        let checker = ConnectionHealthChecker::new(Arc::new(remote));

        let report = checker.check(&devices, TIMEOUT).await;
        assert_eq!(report.healthy, vec![devices[0].clone()]);
        assert_eq!(report.unhealthy, vec![devices[1].clone()]);
        assert_eq!(report.retryable(), vec![devices[1].clone()]);
        assert!(report.excluded().is_empty());
        assert_eq!(report.failures_for(devices[1].id()).len(), 1);
    }

    #[tokio::test]
    async fn test_bad_channel_is_excluded() {
        let (remote, devices) = setup(&["A"]);
        remote.remove_channel(&devices[0].channels().sample);
        let checker = ConnectionHealthChecker::new(Arc::new(remote));

        let report = checker.check(&devices, TIMEOUT).await;
        assert!(report.retryable().is_empty());
        assert_eq!(report.excluded(), devices);
        assert!(matches!(
            report.failures_for(devices[0].id())[0],
            ChannelError::BadChannel(_)
        ));
    }

    #[tokio::test]
    async fn test_slow_channel_times_out() {
        let (remote, devices) = setup(&["A"]);
        remote.set_latency(&devices[0].channels().progress, Duration::from_secs(10));
        let checker = ConnectionHealthChecker::new(Arc::new(remote));

        let started = std::time::Instant::now();
        let report = checker.check(&devices, TIMEOUT).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            report.failures_for(devices[0].id())[0],
            ChannelError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_merge_recheck() {
        let (remote, devices) = setup(&["A", "B", "C"]);
        remote.fail_connects(&devices[1].channels().progress, 1);
        let checker = ConnectionHealthChecker::new(Arc::new(remote));

        let first = checker.check(&devices, TIMEOUT).await;
        assert_eq!(first.unhealthy.len(), 1);

        let recheck = checker.check(&first.retryable(), TIMEOUT).await;
        let merged = first.merge(recheck);
        assert!(merged.all_healthy());
        assert_eq!(merged.healthy, devices);
        assert!(merged.failures.is_empty());
    }

    #[tokio::test]
    async fn test_merge_keeps_request_order() {
        let (remote, devices) = setup(&["A", "B", "C", "D"]);
        remote.fail_connects(&devices[0].channels().progress, 1);
        remote.set_unreachable(&devices[2].channels().motion, true);
        let checker = ConnectionHealthChecker::new(Arc::new(remote));

        let first = checker.check(&devices, TIMEOUT).await;
        assert_eq!(first.healthy, vec![devices[1].clone(), devices[3].clone()]);

        let recheck = checker.check(&first.retryable(), TIMEOUT).await;
        let merged = first.merge(recheck);
        assert_eq!(
            merged.healthy,
            vec![devices[0].clone(), devices[1].clone(), devices[3].clone()]
        );
        assert_eq!(merged.unhealthy, vec![devices[2].clone()]);
        assert_eq!(merged.failures_for(devices[2].id()).len(), 1);
    }
}
