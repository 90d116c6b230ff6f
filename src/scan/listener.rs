//! Scan listeners
//!
//! Observers register a [`ScanListener`] and receive lifecycle notifications.
//! All callbacks are invoked from orchestrator code paths in the order events
//! happen; implementations must return quickly and must not call back into the
//! orchestrator synchronously. A listener that panics is logged and skipped;
//! the remaining listeners and the scan itself carry on.

use super::request::ScanMode;
use crate::device::{Device, DeviceId};
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Receives scan lifecycle notifications. Every method has an empty default.
pub trait ScanListener: Send + Sync {
    /// All devices were commanded and the scan is running.
    fn on_started(&self, _devices: &[Device], _mode: ScanMode) {}

    /// A device's progress changed.
    fn on_progress(&self, _device: &DeviceId, _progress: u32, _max: u32) {}

    /// A sample arrived. `value` is the running average in averaging mode.
    fn on_sample(&self, _device: &DeviceId, _value: f64) {}

    /// A device failed (motion FAIL or a rejected command).
    fn on_device_failed(&self, _device: &DeviceId, _reason: &str) {}

    /// Every device reached its terminal count.
    fn on_completed(&self, _devices: &[DeviceId]) {}

    /// The scan was aborted.
    fn on_aborted(&self, _reason: &str) {}

    /// Actuators were parked.
    fn on_parked(&self) {}

    /// Actuators were stopped.
    fn on_stopped(&self) {}

    /// Human readable status line.
    fn on_status(&self, _message: &str) {}
}

/// Token returned by [`ListenerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered set of registered listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ScanListener>)>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; notifications go out in registration order.
    pub fn register(&self, listener: Arc<dyn ScanListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Invoke `notify` on every listener.
    ///
    /// The lock is released before any callback runs, so a listener may
    /// register or unregister from within a notification. A panic inside a
    /// callback is caught and logged.
    pub fn notify(&self, notify: impl Fn(&dyn ScanListener)) {
        let listeners: Vec<(ListenerId, Arc<dyn ScanListener>)> = self.listeners.read().clone();
        for (id, listener) in listeners {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| notify(listener.as_ref())));
            if let Err(payload) = delivered {
                let message = panic_message(payload.as_ref());
                warn!(listener = id.0, "Listener panicked: {}", message);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
    }

    impl ScanListener for Recorder {
        fn on_status(&self, message: &str) {
            self.messages.lock().push(message.to_string());
        }
    }

    #[test]
    fn test_register_and_notify() {
        let registry = ListenerRegistry::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        registry.register(first.clone());
        let id = registry.register(second.clone());
        assert_eq!(registry.len(), 2);

        registry.notify(|l| l.on_status("hello"));
        assert_eq!(*first.messages.lock(), vec!["hello"]);
        assert_eq!(*second.messages.lock(), vec!["hello"]);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        registry.notify(|l| l.on_status("again"));
        assert_eq!(first.messages.lock().len(), 2);
        assert_eq!(second.messages.lock().len(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        struct Faulty;
        impl ScanListener for Faulty {
            fn on_status(&self, _message: &str) {
                panic!("display went away");
            }
        }

        let registry = ListenerRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.register(Arc::new(Faulty));
        registry.register(recorder.clone());

        registry.notify(|l| l.on_status("first"));
        registry.notify(|l| l.on_status("second"));
        assert_eq!(*recorder.messages.lock(), vec!["first", "second"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_default_methods_are_noops() {
        struct Silent;
        impl ScanListener for Silent {}

        let registry = ListenerRegistry::new();
        registry.register(Arc::new(Silent));
        registry.notify(|l| {
            l.on_parked();
            l.on_progress(&DeviceId::new("A"), 1, 2);
        });
        registry.clear();
        assert!(registry.is_empty());
    }
}
