//! Scan orchestrator
//!
//! Drives a set of devices through one scan at a time:
//!
//! 1. **Connecting**: health-check every requested device; re-check devices
//!    with retryable failures once; ask the [`ContinueDecision`] hook whether
//!    to go on without devices that are still unhealthy.
//! 2. **Provisioning**: subscribe progress, motion and sample monitors, write
//!    default parameters if requested and command every healthy device.
//! 3. **Running**: a single event-loop task applies monitor events until every
//!    device completes, a device fails, or the operator aborts, parks or stops.
//! 4. **Teardown**: release monitors, send abort/park/stop commands as needed,
//!    notify listeners once and return to `Idle`.
//!
//! State is published through a `tokio::sync::watch` channel so callers can
//! observe transitions without polling.

use super::decision::{AlwaysContinue, ContinueDecision};
use super::listener::{ListenerId, ListenerRegistry, ScanListener};
use super::request::{validate_unique, AcquisitionMode, ParameterMode, ScanMode, ScanRequest};
use super::session::{ScanEvent, ScanSession, Terminal};
use super::state::{OutcomeKind, ScanOutcome, ScanState, StartOutcome};
use crate::averager::AveragerBank;
use crate::channel::{read_value, write_value, ChannelValue, RemoteChannel};
use crate::config::ScanSettings;
use crate::device::{Device, DeviceChannels, DeviceId};
use crate::error::{AppResult, ChannelError, ScanError};
use crate::health::{ConnectionHealthChecker, HealthReport};
use crate::progress::{DeviceProgress, ProgressTracker};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Value written to command, abort, park and stop channels.
const COMMAND_VALUE: i64 = 1;

/// One sample returned by [`ScanOrchestrator::acquire_once`].
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredSample {
    /// Device the sample was read from
    pub device: DeviceId,
    /// Raw value
    pub value: f64,
    /// Running average after this sample (averaging mode only)
    pub average: Option<f64>,
}

/// Result of [`ScanOrchestrator::acquire_once`].
#[derive(Debug, Clone)]
pub struct AcquireReport {
    /// Samples of every healthy device that answered, in request order
    pub samples: Vec<AcquiredSample>,
    /// Health of the requested devices
    pub health: HealthReport,
    /// Healthy devices whose read failed
    pub read_failures: HashMap<DeviceId, ChannelError>,
}

/// Session bookkeeping shared with command methods.
///
/// Every transition into or out of `Idle` happens with this lock held, so
/// `abort`, `park` and `stop` never observe a half-finished session.
#[derive(Default)]
struct Control {
    session_id: Option<Uuid>,
    events: Option<mpsc::UnboundedSender<ScanEvent>>,
    tracker: Option<ProgressTracker>,
    devices: Vec<Device>,
    last_snapshot: BTreeMap<DeviceId, DeviceProgress>,
    last_outcome: Option<ScanOutcome>,
    acquiring: bool,
}

/// Holds the orchestrator for one `acquire_once` call; released on drop.
struct AcquireReservation<'a> {
    control: &'a Mutex<Control>,
}

impl Drop for AcquireReservation<'_> {
    fn drop(&mut self) {
        self.control.lock().acquiring = false;
    }
}

struct Inner {
    remote: Arc<dyn RemoteChannel>,
    settings: ScanSettings,
    checker: ConnectionHealthChecker,
    decision: Arc<dyn ContinueDecision>,
    listeners: ListenerRegistry,
    state: watch::Sender<ScanState>,
    abort: watch::Sender<bool>,
    control: Mutex<Control>,
    acquire_averagers: Mutex<AveragerBank>,
}

/// Cloneable handle to the orchestrator.
#[derive(Clone)]
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
}

impl ScanOrchestrator {
    /// Create an orchestrator that continues with healthy devices without
    /// asking.
    pub fn new(remote: Arc<dyn RemoteChannel>, settings: ScanSettings) -> Self {
        Self::with_decision(remote, settings, Arc::new(AlwaysContinue))
    }

    /// Create an orchestrator with an operator decision hook.
    pub fn with_decision(
        remote: Arc<dyn RemoteChannel>,
        settings: ScanSettings,
        decision: Arc<dyn ContinueDecision>,
    ) -> Self {
        let (state, _) = watch::channel(ScanState::Idle);
        let (abort, _) = watch::channel(false);
        let averagers = AveragerBank::new(settings.averaging_weight);
        Self {
            inner: Arc::new(Inner {
                checker: ConnectionHealthChecker::new(remote.clone()),
                remote,
                settings,
                decision,
                listeners: ListenerRegistry::new(),
                state,
                abort,
                control: Mutex::new(Control::default()),
                acquire_averagers: Mutex::new(averagers),
            }),
        }
    }

    /// Settings this orchestrator was built with.
    pub fn settings(&self) -> &ScanSettings {
        &self.inner.settings
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScanState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ScanState> {
        self.inner.state.subscribe()
    }

    /// Register a listener.
    pub fn register_listener(&self, listener: Arc<dyn ScanListener>) -> ListenerId {
        self.inner.listeners.register(listener)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.unregister(id)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Run connection checking and provisioning for a new scan.
    ///
    /// Returns once the scan is running, or once it ended before reaching
    /// `Running` (declined, no healthy device, aborted or a provisioning
    /// failure). The running scan is driven by a background task; use
    /// [`wait_until_idle`](Self::wait_until_idle) to wait for it.
    ///
    /// # Errors
    ///
    /// - [`ScanError::InvalidRequest`] if the request fails validation
    /// - [`ScanError::Busy`] if a session is already active
    pub async fn start(&self, request: ScanRequest) -> AppResult<StartOutcome> {
        let max = request.validate()?;
        let session_id = self.begin_session()?;
        let span = info_span!("scan", session = %session_id);
        Ok(self.startup(session_id, request, max).instrument(span).await)
    }

    /// Request an abort of the active session.
    ///
    /// Before `Running` the startup sequence stops at its next checkpoint
    /// without commanding further devices. While `Running` every commanded
    /// device receives an abort command. Returns `false` if there is nothing
    /// to abort.
    pub fn abort(&self) -> bool {
        let control = self.inner.control.lock();
        let state = *self.inner.state.borrow();
        if !state.can_abort() {
            debug!(state = %state, "Abort ignored");
            return false;
        }
        info!(state = %state, "Abort requested");
        self.inner.abort.send_replace(true);
        if let Some(events) = &control.events {
            let _ = events.send(ScanEvent::Abort);
        }
        true
    }

    /// Park every actuator of the running scan and end it.
    ///
    /// # Errors
    ///
    /// - [`ScanError::NotRunning`] outside `Running`
    /// - [`ScanError::Unsupported`] if no device in the scan can be parked
    pub fn park(&self) -> AppResult<()> {
        self.request_halt(ScanEvent::Park, "park", Device::supports_park)
    }

    /// Stop every actuator of the running scan and end it.
    ///
    /// # Errors
    ///
    /// - [`ScanError::NotRunning`] outside `Running`
    /// - [`ScanError::Unsupported`] if no device in the scan can be stopped
    pub fn stop(&self) -> AppResult<()> {
        self.request_halt(ScanEvent::Stop, "stop", Device::supports_stop)
    }

    fn request_halt(
        &self,
        event: ScanEvent,
        action: &str,
        supported: fn(&Device) -> bool,
    ) -> AppResult<()> {
        let control = self.inner.control.lock();
        let state = *self.inner.state.borrow();
        if state != ScanState::Running {
            return Err(ScanError::NotRunning);
        }
        if !control.devices.iter().any(|device| supported(device)) {
            return Err(ScanError::Unsupported(format!(
                "no device in this scan supports {action}"
            )));
        }
        match &control.events {
            Some(events) if events.send(event).is_ok() => {
                info!("{} requested", action);
                Ok(())
            }
            _ => Err(ScanError::NotRunning),
        }
    }

    /// Health-check the devices and read one sample from each healthy one.
    ///
    /// In averaging mode each sample is folded into a per-device running mean
    /// that persists across calls until [`reset_averages`](Self::reset_averages).
    ///
    /// The orchestrator is reserved for the whole call: `start` and further
    /// acquisitions are rejected with [`ScanError::Acquiring`] until it returns.
    ///
    /// # Errors
    ///
    /// - [`ScanError::InvalidRequest`] for an empty or duplicated device set
    /// - [`ScanError::Busy`] while a scan session is active
    /// - [`ScanError::Acquiring`] while another acquisition runs
    pub async fn acquire_once(
        &self,
        devices: &[Device],
        mode: AcquisitionMode,
    ) -> AppResult<AcquireReport> {
        if devices.is_empty() {
            return Err(ScanError::InvalidRequest("device set is empty".into()));
        }
        validate_unique(devices)?;
        let _reservation = self.reserve_acquisition()?;

        let settings = &self.inner.settings;
        let health = self
            .inner
            .checker
            .check(devices, settings.connection_timeout())
            .await;

        let remote = self.inner.remote.as_ref();
        let reads = join_all(health.healthy.iter().map(|device| {
            read_value(remote, &device.channels().sample, settings.command_timeout())
        }))
        .await;

        let mut samples = Vec::new();
        let mut read_failures = HashMap::new();
        for (device, result) in health.healthy.iter().zip(reads) {
            let sample = result.and_then(|value| {
                value.as_f64().ok_or_else(|| ChannelError::Read {
                    name: device.channels().sample.clone(),
                    reason: format!("non-numeric value '{value}'"),
                })
            });
            match sample {
                Ok(value) => {
                    let average = (mode == AcquisitionMode::Averaging)
                        .then(|| self.inner.acquire_averagers.lock().update(device.id(), value));
                    let reported = average.unwrap_or(value);
                    self.inner
                        .listeners
                        .notify(|l| l.on_sample(device.id(), reported));
                    samples.push(AcquiredSample {
                        device: device.id().clone(),
                        value,
                        average,
                    });
                }
                Err(err) => {
                    warn!(device = %device.id(), "Sample read failed: {}", err);
                    read_failures.insert(device.id().clone(), err);
                }
            }
        }

        info!(
            samples = samples.len(),
            failures = read_failures.len(),
            "Single acquisition finished"
        );
        Ok(AcquireReport {
            samples,
            health,
            read_failures,
        })
    }

    /// Discard the running means kept by [`acquire_once`](Self::acquire_once).
    pub fn reset_averages(&self) {
        self.inner.acquire_averagers.lock().reset();
    }

    /// Progress of the active session, or of the last one once it ended.
    pub fn progress_snapshot(&self) -> BTreeMap<DeviceId, DeviceProgress> {
        let control = self.inner.control.lock();
        match &control.tracker {
            Some(tracker) => tracker.snapshot(),
            None => control.last_snapshot.clone(),
        }
    }

    /// Identifier of the active session.
    pub fn session_id(&self) -> Option<Uuid> {
        self.inner.control.lock().session_id
    }

    /// How the most recent session ended.
    pub fn last_outcome(&self) -> Option<ScanOutcome> {
        self.inner.control.lock().last_outcome.clone()
    }

    /// Wait until the orchestrator is `Idle`.
    pub async fn wait_until_idle(&self) {
        let mut state = self.inner.state.subscribe();
        loop {
            if *state.borrow_and_update() == ScanState::Idle {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Abort any active session, wait for teardown and drop every listener.
    pub async fn shutdown(&self) {
        if self.abort() {
            info!("Aborting active scan for shutdown");
        }
        self.wait_until_idle().await;
        self.inner.listeners.clear();
        info!("Scan orchestrator shut down");
    }

    fn reserve_acquisition(&self) -> AppResult<AcquireReservation<'_>> {
        let mut control = self.inner.control.lock();
        let state = *self.inner.state.borrow();
        if !state.can_start() {
            return Err(ScanError::Busy(state));
        }
        if control.acquiring {
            return Err(ScanError::Acquiring);
        }
        control.acquiring = true;
        Ok(AcquireReservation {
            control: &self.inner.control,
        })
    }

    fn begin_session(&self) -> AppResult<Uuid> {
        let mut control = self.inner.control.lock();
        let state = *self.inner.state.borrow();
        if !state.can_start() {
            return Err(ScanError::Busy(state));
        }
        if control.acquiring {
            return Err(ScanError::Acquiring);
        }
        let session_id = Uuid::new_v4();
        control.session_id = Some(session_id);
        control.last_snapshot.clear();
        self.inner.abort.send_replace(false);
        self.inner.state.send_replace(ScanState::Connecting);
        Ok(session_id)
    }

    async fn startup(&self, session_id: Uuid, request: ScanRequest, max: u32) -> StartOutcome {
        let mode = request.mode();
        let devices = request.devices().to_vec();
        info!(devices = devices.len(), steps = max, %mode, "Starting scan");

        if self.inner.settings.warn_before_destructive_mode
            && mode.parameters == ParameterMode::Defaults
        {
            match self
                .until_aborted(self.inner.decision.confirm_destructive(&devices))
                .await
            {
                None => return self.abort_startup(session_id, None).await,
                Some(false) => {
                    return self.terminate(
                        session_id,
                        "operator declined overwriting device parameters".to_string(),
                        None,
                    )
                }
                Some(true) => {}
            }
        }

        let Some(health) = self.check_health(&devices).await else {
            return self.abort_startup(session_id, None).await;
        };

        if !health.all_healthy() {
            match self
                .until_aborted(self.inner.decision.continue_with_unhealthy(&health))
                .await
            {
                None => return self.abort_startup(session_id, None).await,
                Some(false) => {
                    let reason = format!("operator declined to continue ({})", health.summary());
                    return self.terminate(session_id, reason, Some(health));
                }
                Some(true) => {}
            }
        }

        if health.healthy.is_empty() {
            let reason = format!("no healthy devices ({})", health.summary());
            return self.terminate(session_id, reason, Some(health));
        }

        if self.abort_requested() {
            return self.abort_startup(session_id, None).await;
        }

        self.provision(session_id, health, mode, max).await
    }

    /// Initial check plus one re-check of devices with retryable failures.
    /// Returns `None` if an abort arrived first.
    async fn check_health(&self, devices: &[Device]) -> Option<HealthReport> {
        let timeout = self.inner.settings.connection_timeout();
        let report = self
            .until_aborted(self.inner.checker.check(devices, timeout))
            .await?;
        if report.all_healthy() {
            return Some(report);
        }

        let retry = report.retryable();
        if retry.is_empty() {
            return Some(report);
        }
        info!(devices = retry.len(), "Re-checking unhealthy devices");
        let recheck = self
            .until_aborted(self.inner.checker.check(&retry, timeout))
            .await?;
        Some(report.merge(recheck))
    }

    async fn provision(
        &self,
        session_id: Uuid,
        health: HealthReport,
        mode: ScanMode,
        max: u32,
    ) -> StartOutcome {
        self.set_state(ScanState::Provisioning);

        let settings = &self.inner.settings;
        let mut session = ScanSession::new(
            session_id,
            health.healthy.clone(),
            mode,
            max,
            settings.averaging_weight,
            settings.connection_timeout(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let mut control = self.inner.control.lock();
            control.events = Some(events_tx.clone());
            control.tracker = Some(session.tracker.clone());
            control.devices = session.devices.clone();
        }

        if let Err(err) = session.register_monitors(&events_tx) {
            let reason = format!("monitor registration failed: {err}");
            return self.abort_startup(session_id, Some((session, reason))).await;
        }
        drop(events_tx);

        let started = self
            .until_aborted(session.pool.start(self.inner.remote.clone()))
            .await;
        match started {
            None => {
                info!("Abort received while starting monitors");
                return self.abort_startup(session_id, Some(operator_abort(session))).await;
            }
            Some(Err(err)) => {
                let reason = format!("monitor start failed: {err}");
                return self.abort_startup(session_id, Some((session, reason))).await;
            }
            Some(Ok(())) => {}
        }

        if mode.parameters == ParameterMode::Defaults {
            let devices = session.devices.clone();
            for device in &devices {
                if self.abort_requested() {
                    return self.abort_startup(session_id, Some(operator_abort(session))).await;
                }
                let value = ChannelValue::Int(i64::from(max));
                if let Err(err) = self.write(&device.channels().steps, value).await {
                    let reason = self.device_failed(device, &err);
                    return self.abort_startup(session_id, Some((session, reason))).await;
                }
            }
        }

        let devices = session.devices.clone();
        for device in &devices {
            if self.abort_requested() {
                return self.abort_startup(session_id, Some(operator_abort(session))).await;
            }
            match self
                .write(&device.channels().command, ChannelValue::Int(COMMAND_VALUE))
                .await
            {
                Ok(()) => {
                    debug!(device = %device.id(), "Scan command acknowledged");
                    session.commanded.push(device.clone());
                }
                Err(err) => {
                    let reason = self.device_failed(device, &err);
                    return self.abort_startup(session_id, Some((session, reason))).await;
                }
            }
        }

        self.set_state(ScanState::Running);
        let ids = session.device_ids();
        self.inner
            .listeners
            .notify(|l| l.on_started(&session.devices, mode));

        let this = self.clone();
        tokio::spawn(
            async move { this.run_session(session, events_rx).await }
                .instrument(tracing::Span::current()),
        );

        StartOutcome::Started {
            session_id,
            devices: ids,
            health,
        }
    }

    async fn run_session(
        self,
        mut session: ScanSession,
        mut events: mpsc::UnboundedReceiver<ScanEvent>,
    ) {
        let terminal = loop {
            match events.recv().await {
                Some(event) => {
                    if let Some(terminal) = session.handle(event, &self.inner.listeners) {
                        break terminal;
                    }
                }
                None => break Terminal::Aborted("event queue closed".to_string()),
            }
        };
        drop(events);
        let session_id = session.id;
        self.teardown(session_id, Some(session), terminal).await;
    }

    /// Tear down after an abort or failure before `Running`.
    async fn abort_startup(
        &self,
        session_id: Uuid,
        session: Option<(ScanSession, String)>,
    ) -> StartOutcome {
        let (session, terminal) = match session {
            Some((session, reason)) => (Some(session), Terminal::Aborted(reason)),
            None => (None, Terminal::Aborted("aborted by operator".to_string())),
        };
        let outcome = self.teardown(session_id, session, terminal).await;
        StartOutcome::Aborted {
            reason: outcome.message,
        }
    }

    /// Drive a session through its terminal state back to `Idle`.
    async fn teardown(
        &self,
        session_id: Uuid,
        session: Option<ScanSession>,
        terminal: Terminal,
    ) -> ScanOutcome {
        self.set_state(terminal.state());

        let mut failed_operations = 0usize;
        let mut devices = Vec::new();
        let mut snapshot = BTreeMap::new();

        if let Some(mut session) = session {
            match session.pool.stop().await {
                Ok(()) => {}
                Err(ScanError::TeardownFailed(failures)) => failed_operations += failures.len(),
                Err(err) => {
                    warn!("Monitor release failed: {}", err);
                    failed_operations += 1;
                }
            }

            for channel in halt_channels(&session, &terminal) {
                if let Err(err) = self.write(&channel, ChannelValue::Int(COMMAND_VALUE)).await {
                    warn!(channel = %channel, "Teardown command failed: {}", err);
                    failed_operations += 1;
                }
            }

            devices = session.device_ids();
            snapshot = session.tracker.snapshot();
            info!(
                elapsed_ms = (Utc::now() - session.started_at).num_milliseconds(),
                "Session released"
            );
        }

        let mut message = terminal.status_message(devices.len());
        if failed_operations > 0 {
            message.push_str(&format!(
                " ({failed_operations} channel operation(s) failed during teardown)"
            ));
        }

        let listeners = &self.inner.listeners;
        listeners.notify(|l| l.on_status(&message));
        match &terminal {
            Terminal::Completed => listeners.notify(|l| l.on_completed(&devices)),
            Terminal::Parked => listeners.notify(|l| l.on_parked()),
            Terminal::Stopped => listeners.notify(|l| l.on_stopped()),
            Terminal::Aborted(_) | Terminal::DeviceFailed(_) => {
                let reason = terminal.abort_reason().unwrap_or_default();
                listeners.notify(|l| l.on_aborted(&reason));
            }
        }

        self.finish(session_id, terminal.kind(), message, snapshot)
    }

    /// End a session during connection checking without touching devices.
    fn terminate(
        &self,
        session_id: Uuid,
        reason: String,
        health: Option<HealthReport>,
    ) -> StartOutcome {
        let message = format!("Scan terminated: {reason}");
        self.inner.listeners.notify(|l| l.on_status(&message));
        self.finish(session_id, OutcomeKind::Terminated, message, BTreeMap::new());
        StartOutcome::Terminated { reason, health }
    }

    fn finish(
        &self,
        session_id: Uuid,
        kind: OutcomeKind,
        message: String,
        snapshot: BTreeMap<DeviceId, DeviceProgress>,
    ) -> ScanOutcome {
        let outcome = ScanOutcome {
            session_id,
            kind,
            message,
            finished_at: Utc::now(),
        };
        {
            let mut control = self.inner.control.lock();
            control.session_id = None;
            control.events = None;
            control.tracker = None;
            control.devices.clear();
            control.last_snapshot = snapshot;
            control.last_outcome = Some(outcome.clone());
            self.inner.state.send_replace(ScanState::Idle);
        }
        info!(outcome = %outcome.kind, "{}", outcome.message);
        outcome
    }

    fn set_state(&self, state: ScanState) {
        let previous = self.inner.state.send_replace(state);
        debug!(from = %previous, to = %state, "State transition");
    }

    fn abort_requested(&self) -> bool {
        *self.inner.abort.borrow()
    }

    /// Run `future` unless an abort is requested first.
    async fn until_aborted<F: Future>(&self, future: F) -> Option<F::Output> {
        let mut abort = self.inner.abort.subscribe();
        let aborted = async move {
            loop {
                if *abort.borrow_and_update() {
                    return;
                }
                if abort.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            biased;
            () = aborted => None,
            output = future => Some(output),
        }
    }

    async fn write(&self, channel: &str, value: ChannelValue) -> Result<(), ChannelError> {
        write_value(
            self.inner.remote.as_ref(),
            channel,
            value,
            self.inner.settings.command_timeout(),
        )
        .await
    }

    fn device_failed(&self, device: &Device, err: &ChannelError) -> String {
        warn!(device = %device.id(), "Command rejected: {}", err);
        let reason = err.to_string();
        self.inner
            .listeners
            .notify(|l| l.on_device_failed(device.id(), &reason));
        format!("device {} rejected a command: {err}", device.id())
    }
}

fn operator_abort(session: ScanSession) -> (ScanSession, String) {
    (session, "aborted by operator".to_string())
}

/// Channels written while tearing down.
fn halt_channels(session: &ScanSession, terminal: &Terminal) -> Vec<String> {
    match terminal {
        Terminal::Completed => Vec::new(),
        Terminal::Aborted(_) | Terminal::DeviceFailed(_) => session
            .commanded
            .iter()
            .map(|device| device.channels().abort.clone())
            .collect(),
        Terminal::Parked => actuator_channels(session, Device::supports_park, |c| c.park.clone()),
        Terminal::Stopped => actuator_channels(session, Device::supports_stop, |c| c.stop.clone()),
    }
}

/// Park or stop channels of capable devices. Commanded devices without the
/// actuator are aborted so none keeps acquiring after the monitors are gone.
fn actuator_channels(
    session: &ScanSession,
    supported: fn(&Device) -> bool,
    channel: fn(&DeviceChannels) -> Option<String>,
) -> Vec<String> {
    session
        .devices
        .iter()
        .filter_map(|device| {
            if supported(device) {
                channel(device.channels())
            } else if session.commanded.contains(device) {
                Some(device.channels().abort.clone())
            } else {
                None
            }
        })
        .collect()
}
