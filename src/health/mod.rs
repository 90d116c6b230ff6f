//! Device connection health checking
//!
//! Before a scan is provisioned, every required channel of every device must be
//! reachable. This module partitions a device set into healthy and unhealthy
//! devices and keeps the per-channel failures for reporting.

pub mod checker;

pub use checker::{ConnectionHealthChecker, HealthReport};
