//! Channel monitoring for active scans
//!
//! A [`MonitorPool`] owns the subscriptions for the devices of one scan and
//! starts/stops them as a unit.

pub mod pool;

pub use pool::{MonitorHandler, MonitorPool, PoolState};
