//! Per-device scan progress and motion status.
//!
//! The tracker is a cloneable handle over a single `parking_lot::RwLock`, so the
//! orchestrator's event loop can mutate it while presentation code takes
//! snapshots. A snapshot is a point-in-time copy taken under one read lock and
//! never shows a partially applied update.
//!
//! # Rules
//!
//! - Progress is clamped to `[0, max]` and never decreases within a session.
//! - `max` is fixed by `init` for the lifetime of the session.
//! - Once a device reports `Fail`, later `Halted`/`Moving` reports are ignored.
//! - `Locked` and `Unknown` reports are display-only and never change the state.

use crate::device::DeviceId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Classification of a device's physical movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MotionState {
    /// No report received yet, or an unrecognised code
    #[default]
    Unknown,
    /// Not moving
    Halted,
    /// In motion
    Moving,
    /// Hardware failure
    Fail,
    /// Interlocked
    Locked,
}

impl MotionState {
    /// Decode a motion status channel value.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MotionState::Halted,
            1 => MotionState::Moving,
            2 => MotionState::Fail,
            3 => MotionState::Locked,
            _ => MotionState::Unknown,
        }
    }

    /// Channel code for this state.
    pub fn code(self) -> i64 {
        match self {
            MotionState::Halted => 0,
            MotionState::Moving => 1,
            MotionState::Fail => 2,
            MotionState::Locked => 3,
            MotionState::Unknown => -1,
        }
    }
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionState::Unknown => write!(f, "UNKNOWN"),
            MotionState::Halted => write!(f, "HALTED"),
            MotionState::Moving => write!(f, "MOVING"),
            MotionState::Fail => write!(f, "FAIL"),
            MotionState::Locked => write!(f, "LOCKED"),
        }
    }
}

/// Progress entry for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProgress {
    /// Current step/sample count
    pub progress: u32,
    /// Terminal count
    pub max: u32,
    /// Last accepted motion state
    pub motion: MotionState,
}

impl DeviceProgress {
    /// Whether the device reached its terminal count.
    pub fn is_complete(&self) -> bool {
        self.progress >= self.max
    }

    /// Completion ratio in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.max == 0 {
            1.0
        } else {
            f64::from(self.progress) / f64::from(self.max)
        }
    }
}

/// Result of a progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Progress after the update
    pub progress: u32,
    /// Whether the stored value changed
    pub changed: bool,
    /// Whether the device is now at max
    pub reached_max: bool,
}

/// Result of a motion update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionUpdate {
    /// Motion state after the update
    pub state: MotionState,
    /// Whether this update moved the device into `Fail`
    pub newly_failed: bool,
}

/// Shared per-device progress table.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    entries: Arc<RwLock<BTreeMap<DeviceId, DeviceProgress>>>,
}

impl ProgressTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device with progress 0, the given max and `Unknown` motion.
    ///
    /// Re-initialising a device resets its entry.
    pub fn init(&self, device: &DeviceId, max: u32) {
        self.entries.write().insert(
            device.clone(),
            DeviceProgress {
                progress: 0,
                max,
                motion: MotionState::Unknown,
            },
        );
    }

    /// Apply a progress report. Returns `None` for unknown devices.
    pub fn set_progress(&self, device: &DeviceId, value: i64) -> Option<ProgressUpdate> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(device)?;

        let clamped = value.clamp(0, i64::from(entry.max)) as u32;
        let changed = clamped > entry.progress;
        if changed {
            entry.progress = clamped;
        }

        Some(ProgressUpdate {
            progress: entry.progress,
            changed,
            reached_max: entry.is_complete(),
        })
    }

    /// Apply a motion report. Returns `None` for unknown devices.
    pub fn set_motion(&self, device: &DeviceId, state: MotionState) -> Option<MotionUpdate> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(device)?;

        let previous = entry.motion;
        let next = match (previous, state) {
            (_, MotionState::Locked | MotionState::Unknown) => previous,
            (MotionState::Fail, _) => MotionState::Fail,
            (_, next) => next,
        };
        entry.motion = next;

        Some(MotionUpdate {
            state: next,
            newly_failed: next == MotionState::Fail && previous != MotionState::Fail,
        })
    }

    /// Consistent copy of every entry.
    pub fn snapshot(&self) -> BTreeMap<DeviceId, DeviceProgress> {
        self.entries.read().clone()
    }

    /// Entry for one device.
    pub fn get(&self, device: &DeviceId) -> Option<DeviceProgress> {
        self.entries.read().get(device).copied()
    }

    /// Whether every tracked device reached its max. False when empty.
    pub fn is_complete(&self) -> bool {
        let entries = self.entries.read();
        !entries.is_empty() && entries.values().all(DeviceProgress::is_complete)
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no device is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry.
    pub fn reset(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    #[test]
    fn test_init_defaults() {
        let tracker = ProgressTracker::new();
        tracker.init(&dev("A"), 10);

        let entry = tracker.get(&dev("A")).unwrap();
        assert_eq!(entry.progress, 0);
        assert_eq!(entry.max, 10);
        assert_eq!(entry.motion, MotionState::Unknown);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn test_progress_clamping() {
        let tracker = ProgressTracker::new();
        tracker.init(&dev("A"), 10);
        tracker.init(&dev("B"), 10);

        let update = tracker.set_progress(&dev("A"), 42).unwrap();
        assert_eq!(update.progress, 10);
        assert!(update.reached_max);

        let update = tracker.set_progress(&dev("B"), -5).unwrap();
        assert_eq!(update.progress, 0);
        assert!(!update.changed);
    }

    #[test]
    fn test_progress_never_decreases() {
        let tracker = ProgressTracker::new();
        tracker.init(&dev("A"), 10);

        tracker.set_progress(&dev("A"), 6);
        let update = tracker.set_progress(&dev("A"), 3).unwrap();
        assert_eq!(update.progress, 6);
        assert!(!update.changed);
    }

    #[test]
    fn test_unknown_device_is_ignored() {
        let tracker = ProgressTracker::new();
        assert!(tracker.set_progress(&dev("ghost"), 1).is_none());
        assert!(tracker.set_motion(&dev("ghost"), MotionState::Fail).is_none());
    }

    #[test]
    fn test_sticky_failure() {
        let tracker = ProgressTracker::new();
        tracker.init(&dev("A"), 5);

        let update = tracker.set_motion(&dev("A"), MotionState::Fail).unwrap();
        assert!(update.newly_failed);

        for state in [MotionState::Halted, MotionState::Moving] {
            let update = tracker.set_motion(&dev("A"), state).unwrap();
            assert_eq!(update.state, MotionState::Fail);
            assert!(!update.newly_failed);
        }
        assert_eq!(tracker.get(&dev("A")).unwrap().motion, MotionState::Fail);
    }

    #[test]
    fn test_locked_and_unknown_are_ignored() {
        let tracker = ProgressTracker::new();
        tracker.init(&dev("A"), 5);

        tracker.set_motion(&dev("A"), MotionState::Moving);
        tracker.set_motion(&dev("A"), MotionState::Locked);
        tracker.set_motion(&dev("A"), MotionState::Unknown);
        assert_eq!(tracker.get(&dev("A")).unwrap().motion, MotionState::Moving);
    }

    #[test]
    fn test_motion_codes() {
        for state in [
            MotionState::Halted,
            MotionState::Moving,
            MotionState::Fail,
            MotionState::Locked,
        ] {
            assert_eq!(MotionState::from_code(state.code()), state);
        }
        assert_eq!(MotionState::from_code(99), MotionState::Unknown);
    }

    #[test]
    fn test_completion_requires_every_device() {
        let tracker = ProgressTracker::new();
        tracker.init(&dev("A"), 2);
        tracker.init(&dev("B"), 2);

        tracker.set_progress(&dev("A"), 2);
        assert!(!tracker.is_complete());
        tracker.set_progress(&dev("B"), 2);
        assert!(tracker.is_complete());

        tracker.reset();
        assert!(tracker.is_empty());
        assert!(!tracker.is_complete());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let tracker = ProgressTracker::new();
        tracker.init(&dev("A"), 10_000);
        tracker.init(&dev("B"), 10_000);

        let handles: Vec<_> = ["A", "B"]
            .into_iter()
            .map(|id| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for value in 1..=10_000 {
                        tracker.set_progress(&dev(id), value);
                        let snapshot = tracker.snapshot();
                        assert_eq!(snapshot.len(), 2);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[&dev("A")].progress, 10_000);
        assert_eq!(snapshot[&dev("B")].progress, 10_000);
        assert!(tracker.is_complete());
    }
}
