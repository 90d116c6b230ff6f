//! In-memory remote channel implementation.
//!
//! Provides a simulated process-value layer for testing without hardware. All
//! waiting uses async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! Besides plain value storage, `MockRemote` can inject the failure modes the
//! orchestrator has to handle:
//!
//! - unknown channel names (`remove_channel`) → `BadChannel`
//! - unreachable endpoints, permanently or for the next N attempts
//! - connection latency (combined with the caller's timeout → `Timeout`)
//! - failing writes, reads and subscriptions
//! - paused subscriptions, to hold a scan inside monitor start-up
//!
//! `simulate_scan` and `simulate_failure` install write hooks so that commanding
//! a device makes it report progress like a real scanner would.

use super::{ChannelHandle, ChannelValue, RemoteChannel, SubscriptionHandle, ValueCallback};
use crate::device::Device;
use crate::error::ChannelError;
use crate::progress::MotionState;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Hook invoked after a successful write to a channel.
pub type WriteHook = Arc<dyn Fn(&MockRemote, &ChannelValue) + Send + Sync>;

/// A write accepted by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Channel name
    pub channel: String,
    /// Written value
    pub value: ChannelValue,
}

#[derive(Debug, Clone)]
struct MockChannel {
    value: ChannelValue,
    latency: Duration,
    unreachable: bool,
    failing_connects: u32,
    fail_writes: bool,
    fail_reads: bool,
    fail_subscribes: bool,
}

impl MockChannel {
    fn new(value: ChannelValue) -> Self {
        Self {
            value,
            latency: Duration::ZERO,
            unreachable: false,
            failing_connects: 0,
            fail_writes: false,
            fail_reads: false,
            fail_subscribes: false,
        }
    }
}

#[derive(Default)]
struct MockState {
    channels: HashMap<String, MockChannel>,
    subscriptions: HashMap<u64, (String, ValueCallback)>,
    next_id: u64,
    writes: Vec<WriteRecord>,
    connect_attempts: HashMap<String, u32>,
    write_hooks: HashMap<String, Vec<WriteHook>>,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Simulated remote channel layer.
///
/// Cloning yields another handle to the same simulated channels.
///
/// # Example
///
/// ```rust,ignore
/// let remote = MockRemote::new();
/// remote.add_channel("WS01:Scan_Progress", ChannelValue::Int(0));
/// let handle = remote.connect("WS01:Scan_Progress", Duration::from_secs(1)).await?;
/// remote.emit("WS01:Scan_Progress", ChannelValue::Int(5));
/// assert_eq!(remote.read(&handle).await?, ChannelValue::Int(5));
/// ```
#[derive(Clone)]
pub struct MockRemote {
    state: Arc<Mutex<MockState>>,
    subscribe_gate: Arc<watch::Sender<bool>>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    /// Create an empty mock with no channels.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            subscribe_gate: Arc::new(gate),
        }
    }

    /// Create a mock that already serves every channel of `devices`.
    pub fn with_devices<'a>(devices: impl IntoIterator<Item = &'a Device>) -> Self {
        let remote = Self::new();
        for device in devices {
            remote.add_device(device);
        }
        remote
    }

    /// Serve a channel with an initial value.
    pub fn add_channel(&self, name: impl Into<String>, initial: ChannelValue) {
        self.state
            .lock()
            .channels
            .insert(name.into(), MockChannel::new(initial));
    }

    /// Serve every declared channel of a device, initialised to zero.
    pub fn add_device(&self, device: &Device) {
        for name in device.channels().all() {
            self.add_channel(name, ChannelValue::Int(0));
        }
    }

    /// Stop serving a channel; later connects fail with `BadChannel`.
    pub fn remove_channel(&self, name: &str) {
        self.state.lock().channels.remove(name);
    }

    /// Make a channel permanently unreachable (or reachable again).
    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        self.with_channel(name, |ch| ch.unreachable = unreachable);
    }

    /// Fail the next `attempts` connects to a channel.
    pub fn fail_connects(&self, name: &str, attempts: u32) {
        self.with_channel(name, |ch| ch.failing_connects = attempts);
    }

    /// Delay every connect to a channel.
    pub fn set_latency(&self, name: &str, latency: Duration) {
        self.with_channel(name, |ch| ch.latency = latency);
    }

    /// Reject every write to a channel.
    pub fn fail_writes(&self, name: &str) {
        self.with_channel(name, |ch| ch.fail_writes = true);
    }

    /// Reject every read from a channel.
    pub fn fail_reads(&self, name: &str) {
        self.with_channel(name, |ch| ch.fail_reads = true);
    }

    /// Reject every subscription to a channel while connects keep working.
    pub fn fail_subscribes(&self, name: &str) {
        self.with_channel(name, |ch| ch.fail_subscribes = true);
    }

    /// Hold every `subscribe` call until [`resume_subscriptions`](Self::resume_subscriptions).
    pub fn pause_subscriptions(&self) {
        self.subscribe_gate.send_replace(true);
    }

    /// Release held `subscribe` calls.
    pub fn resume_subscriptions(&self) {
        self.subscribe_gate.send_replace(false);
    }

    /// Run `hook` after each successful write to `name`.
    pub fn on_write(&self, name: impl Into<String>, hook: WriteHook) {
        self.state
            .lock()
            .write_hooks
            .entry(name.into())
            .or_default()
            .push(hook);
    }

    /// Publish a new value and notify every subscriber of the channel.
    ///
    /// Callbacks run on the caller's thread, like a channel-access delivery thread.
    pub fn emit(&self, name: &str, value: ChannelValue) {
        let callbacks: Vec<ValueCallback> = {
            let mut state = self.state.lock();
            if let Some(channel) = state.channels.get_mut(name) {
                channel.value = value.clone();
            }
            state
                .subscriptions
                .values()
                .filter(|(channel, _)| channel == name)
                .map(|(_, callback)| callback.clone())
                .collect()
        };

        for callback in callbacks {
            callback(value.clone());
        }
    }

    /// Current value of a channel.
    pub fn value(&self, name: &str) -> Option<ChannelValue> {
        self.state.lock().channels.get(name).map(|ch| ch.value.clone())
    }

    /// Every accepted write, in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    /// Accepted writes to one channel.
    pub fn writes_to(&self, name: &str) -> Vec<ChannelValue> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.channel == name)
            .map(|w| w.value.clone())
            .collect()
    }

    /// Number of connect attempts made for a channel.
    pub fn connect_attempts(&self, name: &str) -> u32 {
        self.state
            .lock()
            .connect_attempts
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Number of live subscriptions across all channels.
    pub fn live_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Make `device` behave like a scanner when its command channel is written.
    ///
    /// On command the device reports `Moving`, then advances its progress channel
    /// once per `step_delay` up to the value of its steps channel (or
    /// `default_steps` if that is not positive), publishes a sample per step and
    /// finally reports `Halted`. Writing the abort, park or stop channel ends the
    /// simulated motion early.
    pub fn simulate_scan(&self, device: &Device, default_steps: i64, step_delay: Duration) {
        self.install_simulation(device, default_steps, step_delay, None);
    }

    /// Like [`simulate_scan`](Self::simulate_scan), but the device reports
    /// `Fail` on its motion channel after `fail_after` steps.
    pub fn simulate_failure(
        &self,
        device: &Device,
        default_steps: i64,
        step_delay: Duration,
        fail_after: i64,
    ) {
        self.install_simulation(device, default_steps, step_delay, Some(fail_after));
    }

    fn install_simulation(
        &self,
        device: &Device,
        default_steps: i64,
        step_delay: Duration,
        fail_after: Option<i64>,
    ) {
        let channels = device.channels().clone();
        let halted = Arc::new(AtomicBool::new(false));

        let mut halting = vec![channels.abort.clone()];
        halting.extend(channels.park.clone());
        halting.extend(channels.stop.clone());
        for name in halting {
            let halted = halted.clone();
            self.on_write(
                name,
                Arc::new(move |_: &MockRemote, _: &ChannelValue| {
                    halted.store(true, Ordering::SeqCst);
                }),
            );
        }

        let command = channels.command.clone();
        self.on_write(
            command,
            Arc::new(move |remote: &MockRemote, _: &ChannelValue| {
                halted.store(false, Ordering::SeqCst);
                let remote = remote.clone();
                let channels = channels.clone();
                let halted = halted.clone();
                let steps = remote
                    .value(&channels.steps)
                    .and_then(|v| v.as_i64())
                    .filter(|s| *s > 0)
                    .unwrap_or(default_steps);

                tokio::spawn(async move {
                    remote.emit(&channels.motion, MotionState::Moving.code().into());
                    for step in 1..=steps {
                        sleep(step_delay).await;
                        if halted.load(Ordering::SeqCst) {
                            remote.emit(&channels.motion, MotionState::Halted.code().into());
                            return;
                        }
                        if fail_after.is_some_and(|n| step > n) {
                            remote.emit(&channels.motion, MotionState::Fail.code().into());
                            return;
                        }
                        let sample = {
                            let mut rng = rand::thread_rng();
                            100.0 + rng.gen_range(-1.0..1.0)
                        };
                        remote.emit(&channels.sample, ChannelValue::Float(sample));
                        remote.emit(&channels.progress, ChannelValue::Int(step));
                    }
                    remote.emit(&channels.motion, MotionState::Halted.code().into());
                });
            }),
        );
    }

    fn with_channel(&self, name: &str, update: impl FnOnce(&mut MockChannel)) {
        let mut state = self.state.lock();
        let channel = state
            .channels
            .entry(name.to_string())
            .or_insert_with(|| MockChannel::new(ChannelValue::Int(0)));
        update(channel);
    }
}

#[async_trait]
impl RemoteChannel for MockRemote {
    async fn connect(&self, name: &str, timeout: Duration) -> Result<ChannelHandle, ChannelError> {
        let latency = {
            let mut state = self.state.lock();
            *state.connect_attempts.entry(name.to_string()).or_default() += 1;
            match state.channels.get(name) {
                Some(channel) => channel.latency,
                None => return Err(ChannelError::BadChannel(name.to_string())),
            }
        };

        if latency > timeout {
            sleep(timeout).await;
            return Err(ChannelError::Timeout {
                name: name.to_string(),
                timeout,
            });
        }
        if !latency.is_zero() {
            sleep(latency).await;
        }

        let mut state = self.state.lock();
        let id = state.next_id();
        let channel = state
            .channels
            .get_mut(name)
            .ok_or_else(|| ChannelError::BadChannel(name.to_string()))?;

        if channel.unreachable {
            return Err(ChannelError::Unreachable {
                name: name.to_string(),
                reason: "endpoint not responding".into(),
            });
        }
        if channel.failing_connects > 0 {
            channel.failing_connects -= 1;
            return Err(ChannelError::Unreachable {
                name: name.to_string(),
                reason: "connection refused".into(),
            });
        }

        Ok(ChannelHandle::new(name, id))
    }

    async fn subscribe(
        &self,
        handle: &ChannelHandle,
        on_change: ValueCallback,
    ) -> Result<SubscriptionHandle, ChannelError> {
        let mut gate = self.subscribe_gate.subscribe();
        while *gate.borrow_and_update() {
            if let Err(e) = gate.changed().await {
                return Err(ChannelError::Subscribe {
                    name: handle.name().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let mut state = self.state.lock();
        match state.channels.get(handle.name()) {
            None => return Err(ChannelError::BadChannel(handle.name().to_string())),
            Some(channel) if channel.fail_subscribes => {
                return Err(ChannelError::Subscribe {
                    name: handle.name().to_string(),
                    reason: "subscription rejected".into(),
                })
            }
            Some(_) => {}
        }
        let id = state.next_id();
        state
            .subscriptions
            .insert(id, (handle.name().to_string(), on_change));
        Ok(SubscriptionHandle::new(handle.name(), id))
    }

    async fn unsubscribe(&self, subscription: SubscriptionHandle) -> Result<(), ChannelError> {
        self.state.lock().subscriptions.remove(&subscription.id());
        Ok(())
    }

    async fn write(&self, handle: &ChannelHandle, value: ChannelValue) -> Result<(), ChannelError> {
        let hooks = {
            let mut state = self.state.lock();
            let channel = state
                .channels
                .get_mut(handle.name())
                .ok_or_else(|| ChannelError::BadChannel(handle.name().to_string()))?;
            if channel.fail_writes {
                return Err(ChannelError::Write {
                    name: handle.name().to_string(),
                    reason: "write rejected".into(),
                });
            }
            channel.value = value.clone();
            state.writes.push(WriteRecord {
                channel: handle.name().to_string(),
                value: value.clone(),
            });
            state
                .write_hooks
                .get(handle.name())
                .cloned()
                .unwrap_or_default()
        };

        for hook in hooks {
            hook(self, &value);
        }
        Ok(())
    }

    async fn read(&self, handle: &ChannelHandle) -> Result<ChannelValue, ChannelError> {
        let state = self.state.lock();
        let channel = state
            .channels
            .get(handle.name())
            .ok_or_else(|| ChannelError::BadChannel(handle.name().to_string()))?;
        if channel.fail_reads {
            return Err(ChannelError::Read {
                name: handle.name().to_string(),
                reason: "read rejected".into(),
            });
        }
        Ok(channel.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_connect_read_write() {
        let remote = MockRemote::new();
        remote.add_channel("A", ChannelValue::Int(1));

        let handle = remote.connect("A", TIMEOUT).await.unwrap();
        assert_eq!(remote.read(&handle).await.unwrap(), ChannelValue::Int(1));

        remote.write(&handle, ChannelValue::Int(9)).await.unwrap();
        assert_eq!(remote.value("A"), Some(ChannelValue::Int(9)));
        assert_eq!(remote.writes_to("A"), vec![ChannelValue::Int(9)]);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_bad() {
        let remote = MockRemote::new();
        let err = remote.connect("missing", TIMEOUT).await.unwrap_err();
        assert_eq!(err, ChannelError::BadChannel("missing".into()));
    }

    #[tokio::test]
    async fn test_failing_connects_recover() {
        let remote = MockRemote::new();
        remote.add_channel("A", ChannelValue::Int(0));
        remote.fail_connects("A", 1);

        assert!(remote.connect("A", TIMEOUT).await.is_err());
        assert!(remote.connect("A", TIMEOUT).await.is_ok());
        assert_eq!(remote.connect_attempts("A"), 2);
    }

    #[tokio::test]
    async fn test_latency_beyond_timeout() {
        let remote = MockRemote::new();
        remote.add_channel("slow", ChannelValue::Int(0));
        remote.set_latency("slow", Duration::from_secs(5));

        let err = remote
            .connect("slow", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let remote = MockRemote::new();
        remote.add_channel("A", ChannelValue::Int(0));
        let handle = remote.connect("A", TIMEOUT).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sub = remote
            .subscribe(
                &handle,
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        remote.emit("A", ChannelValue::Int(1));
        remote.emit("B", ChannelValue::Int(1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        remote.unsubscribe(sub).await.unwrap();
        remote.emit("A", ChannelValue::Int(2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(remote.live_subscriptions(), 0);
    }
}
