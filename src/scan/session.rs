//! Per-session state owned by the event loop.
//!
//! Everything a running scan mutates lives in [`ScanSession`]. Monitor
//! callbacks never touch it directly; they enqueue a [`ScanEvent`] and the
//! single event-loop task applies events one at a time through
//! [`ScanSession::handle`].

use super::listener::ListenerRegistry;
use super::request::{AcquisitionMode, ScanMode};
use super::state::{OutcomeKind, ScanState};
use crate::averager::AveragerBank;
use crate::channel::ChannelValue;
use crate::device::{Device, DeviceId};
use crate::error::AppResult;
use crate::monitor::{MonitorHandler, MonitorPool};
use crate::progress::{MotionState, ProgressTracker};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Input to the session event loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ScanEvent {
    Progress(DeviceId, ChannelValue),
    Motion(DeviceId, ChannelValue),
    Sample(DeviceId, ChannelValue),
    Abort,
    Park,
    Stop,
}

/// Why a session is ending.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Terminal {
    Completed,
    Aborted(String),
    DeviceFailed(DeviceId),
    Parked,
    Stopped,
}

impl Terminal {
    /// State held while tearing down.
    pub(crate) fn state(&self) -> ScanState {
        match self {
            Terminal::Completed => ScanState::Completing,
            Terminal::Aborted(_) | Terminal::DeviceFailed(_) => ScanState::Aborting,
            Terminal::Parked => ScanState::Parking,
            Terminal::Stopped => ScanState::Stopping,
        }
    }

    pub(crate) fn kind(&self) -> OutcomeKind {
        match self {
            Terminal::Completed => OutcomeKind::Completed,
            Terminal::Aborted(_) | Terminal::DeviceFailed(_) => OutcomeKind::Aborted,
            Terminal::Parked => OutcomeKind::Parked,
            Terminal::Stopped => OutcomeKind::Stopped,
        }
    }

    /// Reason passed to `on_aborted`, if this is an abort.
    pub(crate) fn abort_reason(&self) -> Option<String> {
        match self {
            Terminal::Aborted(reason) => Some(reason.clone()),
            Terminal::DeviceFailed(device) => Some(format!("device {device} reported a failure")),
            _ => None,
        }
    }

    pub(crate) fn status_message(&self, devices: usize) -> String {
        match self {
            Terminal::Completed => format!("Scan completed on {devices} device(s)"),
            Terminal::Parked => "Scan parked".to_string(),
            Terminal::Stopped => "Scan stopped".to_string(),
            Terminal::Aborted(_) | Terminal::DeviceFailed(_) => {
                format!("Scan aborted: {}", self.abort_reason().unwrap_or_default())
            }
        }
    }
}

/// State of one scan from provisioning to teardown.
pub(crate) struct ScanSession {
    pub(crate) id: Uuid,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) devices: Vec<Device>,
    pub(crate) mode: ScanMode,
    pub(crate) max: u32,
    pub(crate) pool: MonitorPool,
    pub(crate) tracker: ProgressTracker,
    pub(crate) averagers: AveragerBank,
    /// Devices whose scan command was acknowledged, in command order
    pub(crate) commanded: Vec<Device>,
}

impl ScanSession {
    pub(crate) fn new(
        id: Uuid,
        devices: Vec<Device>,
        mode: ScanMode,
        max: u32,
        averaging_weight: f64,
        connect_timeout: Duration,
    ) -> Self {
        let tracker = ProgressTracker::new();
        for device in &devices {
            tracker.init(device.id(), max);
        }
        Self {
            id,
            started_at: Utc::now(),
            devices,
            mode,
            max,
            pool: MonitorPool::new(connect_timeout),
            tracker,
            averagers: AveragerBank::new(averaging_weight),
            commanded: Vec::new(),
        }
    }

    pub(crate) fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.id().clone()).collect()
    }

    /// Register progress, motion and sample monitors for every device.
    pub(crate) fn register_monitors(
        &mut self,
        events: &mpsc::UnboundedSender<ScanEvent>,
    ) -> AppResult<()> {
        for device in &self.devices {
            let channels = device.channels();
            let id = device.id();
            self.pool.add_subscription(
                id,
                channels.progress.clone(),
                forward(events, id, ScanEvent::Progress),
            )?;
            self.pool.add_subscription(
                id,
                channels.motion.clone(),
                forward(events, id, ScanEvent::Motion),
            )?;
            self.pool.add_subscription(
                id,
                channels.sample.clone(),
                forward(events, id, ScanEvent::Sample),
            )?;
        }
        Ok(())
    }

    /// Apply one event. Returns the terminal reason once the session must end.
    pub(crate) fn handle(
        &mut self,
        event: ScanEvent,
        listeners: &ListenerRegistry,
    ) -> Option<Terminal> {
        match event {
            ScanEvent::Progress(device, value) => {
                let Some(position) = value.as_i64() else {
                    debug!(device = %device, %value, "Ignoring non-numeric progress");
                    return None;
                };
                let update = self.tracker.set_progress(&device, position)?;
                if update.changed {
                    let max = self.max;
                    listeners.notify(|l| l.on_progress(&device, update.progress, max));
                }
                if self.tracker.is_complete() {
                    info!("All devices reached their terminal count");
                    return Some(Terminal::Completed);
                }
                None
            }
            ScanEvent::Motion(device, value) => {
                let state = value
                    .as_i64()
                    .map_or(MotionState::Unknown, MotionState::from_code);
                let update = self.tracker.set_motion(&device, state)?;
                if update.newly_failed {
                    warn!(device = %device, "Device reported motion failure");
                    listeners.notify(|l| l.on_device_failed(&device, "motion status reported FAIL"));
                    return Some(Terminal::DeviceFailed(device));
                }
                None
            }
            ScanEvent::Sample(device, value) => {
                let Some(sample) = value.as_f64() else {
                    debug!(device = %device, %value, "Ignoring non-numeric sample");
                    return None;
                };
                let reported = match self.mode.acquisition {
                    AcquisitionMode::Averaging => self.averagers.update(&device, sample),
                    AcquisitionMode::StepScan => sample,
                };
                listeners.notify(|l| l.on_sample(&device, reported));
                None
            }
            ScanEvent::Abort => Some(Terminal::Aborted("aborted by operator".to_string())),
            ScanEvent::Park => Some(Terminal::Parked),
            ScanEvent::Stop => Some(Terminal::Stopped),
        }
    }
}

fn forward(
    events: &mpsc::UnboundedSender<ScanEvent>,
    device: &DeviceId,
    wrap: fn(DeviceId, ChannelValue) -> ScanEvent,
) -> MonitorHandler {
    let events = events.clone();
    let device = device.clone();
    Arc::new(move |value| {
        // Closed once the session ended; late values are dropped.
        let _ = events.send(wrap(device.clone(), value));
    })
}
