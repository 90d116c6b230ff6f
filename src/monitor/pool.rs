//! Monitor pool
//!
//! Holds a set of (device, channel, handler) registrations and turns them into
//! live subscriptions on [`start`](MonitorPool::start).
//!
//! # Delivery
//!
//! Each subscription gets its own unbounded queue and delivery task. The remote
//! callback only enqueues the value, so the remote delivery thread is never
//! blocked by a handler, and a slow or panicking handler only delays its own
//! subscription. Values of one channel are delivered in emission order.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start──> Running ──stop──> Idle
//!   │                │
//!   └─ add_subscription (Idle only)
//! ```
//!
//! `start` is all-or-nothing: on the first failure every subscription made so far
//! is released before the error is returned. `stop` is idempotent.

use crate::channel::{connect_within, ChannelValue, RemoteChannel, SubscriptionHandle};
use crate::device::DeviceId;
use crate::error::{ChannelError, ScanError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Handler invoked with each value delivered for a registration.
pub type MonitorHandler = Arc<dyn Fn(ChannelValue) + Send + Sync>;

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting registrations; nothing live
    Idle,
    /// Every registration is subscribed
    Running,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolState::Idle => write!(f, "Idle"),
            PoolState::Running => write!(f, "Running"),
        }
    }
}

struct Registration {
    device: DeviceId,
    channel: String,
    handler: MonitorHandler,
}

struct LiveSubscription {
    device: DeviceId,
    subscription: SubscriptionHandle,
    delivery: JoinHandle<()>,
}

/// Set of channel subscriptions started and stopped as a unit.
pub struct MonitorPool {
    registrations: Vec<Registration>,
    live: Vec<LiveSubscription>,
    state: PoolState,
    remote: Option<Arc<dyn RemoteChannel>>,
    connect_timeout: Duration,
}

impl MonitorPool {
    /// Create an idle pool. `connect_timeout` bounds each channel connect and
    /// each subscribe.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            registrations: Vec::new(),
            live: Vec::new(),
            state: PoolState::Idle,
            remote: None,
            connect_timeout,
        }
    }

    /// Register interest in a device channel.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::PoolRunning`] if the pool has been started.
    pub fn add_subscription(
        &mut self,
        device: &DeviceId,
        channel: impl Into<String>,
        handler: MonitorHandler,
    ) -> Result<(), ScanError> {
        if self.state == PoolState::Running {
            return Err(ScanError::PoolRunning);
        }
        self.registrations.push(Registration {
            device: device.clone(),
            channel: channel.into(),
            handler,
        });
        Ok(())
    }

    /// Subscribe every registration.
    ///
    /// # Errors
    ///
    /// Returns the first connect/subscribe failure after releasing every
    /// subscription made so far, or [`ScanError::PoolRunning`] if already started.
    pub async fn start(&mut self, remote: Arc<dyn RemoteChannel>) -> Result<(), ScanError> {
        if self.state == PoolState::Running {
            return Err(ScanError::PoolRunning);
        }
        self.remote = Some(remote.clone());
        self.state = PoolState::Running;

        for index in 0..self.registrations.len() {
            if let Err(err) = self.subscribe_one(remote.as_ref(), index).await {
                warn!(
                    channel = %self.registrations[index].channel,
                    "Monitor start failed, releasing pool: {}",
                    err
                );
                if let Err(teardown) = self.stop().await {
                    warn!("Release after failed start incomplete: {}", teardown);
                }
                return Err(err.into());
            }
        }

        debug!(subscriptions = self.live.len(), "Monitor pool started");
        Ok(())
    }

    async fn subscribe_one(
        &mut self,
        remote: &dyn RemoteChannel,
        index: usize,
    ) -> Result<(), ChannelError> {
        let registration = &self.registrations[index];
        let handle = connect_within(remote, &registration.channel, self.connect_timeout).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelValue>();
        let handler = registration.handler.clone();
        let delivery = tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                handler(value);
            }
        });

        let callback = Arc::new(move |value: ChannelValue| {
            // Receiver is gone once the pool stopped; late values are dropped.
            let _ = tx.send(value);
        });

        let pending = remote.subscribe(&handle, callback);
        let subscribed = match timeout(self.connect_timeout, pending).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Subscribe {
                name: registration.channel.clone(),
                reason: format!("no answer within {:?}", self.connect_timeout),
            }),
        };

        match subscribed {
            Ok(subscription) => {
                self.live.push(LiveSubscription {
                    device: registration.device.clone(),
                    subscription,
                    delivery,
                });
                Ok(())
            }
            Err(err) => {
                delivery.abort();
                Err(err)
            }
        }
    }

    /// Release every live subscription.
    ///
    /// Safe to call repeatedly, on a never-started pool, and after a failed
    /// start. Local state is always cleared; unsubscribe failures are collected
    /// and returned.
    pub async fn stop(&mut self) -> Result<(), ScanError> {
        let live = std::mem::take(&mut self.live);
        self.state = PoolState::Idle;

        let Some(remote) = self.remote.clone() else {
            return Ok(());
        };

        let mut failures = Vec::new();
        let released = live.len();
        for entry in live {
            entry.delivery.abort();
            if let Err(err) = remote.unsubscribe(entry.subscription).await {
                warn!(device = %entry.device, "Unsubscribe failed: {}", err);
                failures.push(err);
            }
        }

        if released > 0 {
            debug!(released, "Monitor pool stopped");
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ScanError::TeardownFailed(failures))
        }
    }

    /// Drop every registration. Stops the pool first if needed.
    pub async fn clear(&mut self) -> Result<(), ScanError> {
        let result = self.stop().await;
        self.registrations.clear();
        result
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PoolState {
        self.state
    }

    /// Number of live subscriptions.
    pub fn live_subscriptions(&self) -> usize {
        self.live.len()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl Drop for MonitorPool {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            warn!(
                subscriptions = self.live.len(),
                "Monitor pool dropped while running; delivery tasks aborted"
            );
        }
        for entry in &self.live {
            entry.delivery.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockRemote;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn remote_with(channels: &[&str]) -> MockRemote {
        let remote = MockRemote::new();
        for name in channels {
            remote.add_channel(*name, ChannelValue::Int(0));
        }
        remote
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !check() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_delivery_reaches_registered_handler() {
        let remote = remote_with(&["A:pos", "B:pos"]);
        let mut pool = MonitorPool::new(TIMEOUT);

        let a_last = Arc::new(AtomicI64::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let a = a_last.clone();
        let b = b_calls.clone();
        pool.add_subscription(
            &DeviceId::new("A"),
            "A:pos",
            Arc::new(move |v| a.store(v.as_i64().unwrap_or(-1), Ordering::SeqCst)),
        )
        .unwrap();
        pool.add_subscription(
            &DeviceId::new("B"),
            "B:pos",
            Arc::new(move |_| {
                b.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        pool.start(Arc::new(remote.clone())).await.unwrap();
        assert_eq!(pool.live_subscriptions(), 2);

        remote.emit("A:pos", ChannelValue::Int(7));
        eventually(|| a_last.load(Ordering::SeqCst) == 7).await;
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_while_running_is_rejected() {
        let remote = remote_with(&["A:pos"]);
        let mut pool = MonitorPool::new(TIMEOUT);
        pool.add_subscription(&DeviceId::new("A"), "A:pos", Arc::new(|_| {}))
            .unwrap();
        pool.start(Arc::new(remote)).await.unwrap();

        let err = pool
            .add_subscription(&DeviceId::new("A"), "A:pos", Arc::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, ScanError::PoolRunning));
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_leaves_nothing_running() {
        let remote = remote_with(&["A:pos", "A:motion"]);
        let mut pool = MonitorPool::new(TIMEOUT);
        for channel in ["A:pos", "A:motion", "A:missing"] {
            pool.add_subscription(&DeviceId::new("A"), channel, Arc::new(|_| {}))
                .unwrap();
        }

        let err = pool.start(Arc::new(remote.clone())).await.unwrap_err();
        assert!(matches!(
            err,
            ScanError::Channel(ChannelError::BadChannel(_))
        ));
        assert_eq!(pool.state(), PoolState::Idle);
        assert_eq!(pool.live_subscriptions(), 0);
        assert_eq!(remote.live_subscriptions(), 0);

        // Teardown after a partial start is still safe
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_subscribe_times_out() {
        let remote = remote_with(&["A:pos", "A:motion"]);
        let mut pool = MonitorPool::new(TIMEOUT);
        for channel in ["A:pos", "A:motion"] {
            pool.add_subscription(&DeviceId::new("A"), channel, Arc::new(|_| {}))
                .unwrap();
        }
        remote.pause_subscriptions();

        let err = timeout(Duration::from_secs(2), pool.start(Arc::new(remote.clone())))
            .await
            .expect("start never gave up on a stalled subscribe")
            .unwrap_err();
        assert!(matches!(
            err,
            ScanError::Channel(ChannelError::Subscribe { .. })
        ));
        assert_eq!(pool.state(), PoolState::Idle);
        assert_eq!(remote.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut never_started = MonitorPool::new(TIMEOUT);
        never_started.stop().await.unwrap();
        never_started.stop().await.unwrap();
        assert_eq!(never_started.live_subscriptions(), 0);

        let remote = remote_with(&["A:pos"]);
        let mut pool = MonitorPool::new(TIMEOUT);
        pool.add_subscription(&DeviceId::new("A"), "A:pos", Arc::new(|_| {}))
            .unwrap();
        pool.start(Arc::new(remote.clone())).await.unwrap();

        pool.stop().await.unwrap();
        pool.stop().await.unwrap();
        assert_eq!(pool.live_subscriptions(), 0);
        assert_eq!(remote.live_subscriptions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_handler_does_not_starve_others() {
        let remote = remote_with(&["slow", "fast"]);
        let mut pool = MonitorPool::new(TIMEOUT);

        let fast_seen = Arc::new(AtomicUsize::new(0));
        let seen = fast_seen.clone();
        pool.add_subscription(
            &DeviceId::new("S"),
            "slow",
            Arc::new(|_| std::thread::sleep(Duration::from_millis(300))),
        )
        .unwrap();
        pool.add_subscription(
            &DeviceId::new("F"),
            "fast",
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        pool.start(Arc::new(remote.clone())).await.unwrap();

        remote.emit("slow", ChannelValue::Int(1));
        for i in 0..10 {
            remote.emit("fast", ChannelValue::Int(i));
        }
        eventually(|| fast_seen.load(Ordering::SeqCst) == 10).await;

        pool.clear().await.unwrap();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_per_channel_order_is_preserved() {
        let remote = remote_with(&["A:pos"]);
        let mut pool = MonitorPool::new(TIMEOUT);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        pool.add_subscription(
            &DeviceId::new("A"),
            "A:pos",
            Arc::new(move |v| sink.lock().push(v.as_i64().unwrap_or(-1))),
        )
        .unwrap();
        pool.start(Arc::new(remote.clone())).await.unwrap();

        for i in 0..100 {
            remote.emit("A:pos", ChannelValue::Int(i));
        }
        eventually(|| seen.lock().len() == 100).await;
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());

        pool.stop().await.unwrap();
    }
}
