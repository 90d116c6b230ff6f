//! Remote process-value channels.
//!
//! The physical communication layer is an external collaborator. The orchestrator
//! only needs the [`RemoteChannel`] contract: resolve a textual handle into a live
//! channel, subscribe to value changes, and read/write values.
//!
//! # Contract
//!
//! - `connect` resolves a name. Unknown names fail with
//!   [`ChannelError::BadChannel`]; reachable-but-slow endpoints fail with
//!   [`ChannelError::Timeout`] or [`ChannelError::Unreachable`].
//! - `subscribe` registers a callback invoked on every value change. Callbacks may
//!   run on any thread and must return quickly.
//! - `unsubscribe` releases a subscription; releasing an unknown subscription is
//!   not an error.
//!
//! [`mock::MockRemote`] is an in-memory implementation used by tests and the
//! simulator.

pub mod mock;

use crate::error::ChannelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with each new channel value.
pub type ValueCallback = Arc<dyn Fn(ChannelValue) + Send + Sync>;

/// A process value carried by a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelValue {
    /// Integer value (counters, status codes, commands)
    Int(i64),
    /// Floating point value (samples, positions)
    Float(f64),
    /// Text value
    Text(String),
}

impl ChannelValue {
    /// Integer view of the value. Floats are truncated; text is parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ChannelValue::Int(v) => Some(*v),
            ChannelValue::Float(v) if v.is_finite() => Some(*v as i64),
            ChannelValue::Float(_) => None,
            ChannelValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Floating point view of the value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Int(v) => Some(*v as f64),
            ChannelValue::Float(v) => Some(*v),
            ChannelValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelValue::Int(v) => write!(f, "{v}"),
            ChannelValue::Float(v) => write!(f, "{v}"),
            ChannelValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ChannelValue {
    fn from(value: i64) -> Self {
        ChannelValue::Int(value)
    }
}

impl From<f64> for ChannelValue {
    fn from(value: f64) -> Self {
        ChannelValue::Float(value)
    }
}

/// A connected channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    name: String,
    id: u64,
}

impl ChannelHandle {
    /// Create a handle. Intended for [`RemoteChannel`] implementations.
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    /// Channel name this handle was connected with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Implementation-defined connection id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A live subscription returned by [`RemoteChannel::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    channel: String,
    id: u64,
}

impl SubscriptionHandle {
    /// Create a handle. Intended for [`RemoteChannel`] implementations.
    pub fn new(channel: impl Into<String>, id: u64) -> Self {
        Self {
            channel: channel.into(),
            id,
        }
    }

    /// Subscribed channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Implementation-defined subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Connectable, subscribable remote value endpoint.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Resolve and connect a channel by name.
    async fn connect(&self, name: &str, timeout: Duration) -> Result<ChannelHandle, ChannelError>;

    /// Register a callback for value changes on a connected channel.
    async fn subscribe(
        &self,
        handle: &ChannelHandle,
        on_change: ValueCallback,
    ) -> Result<SubscriptionHandle, ChannelError>;

    /// Release a subscription.
    async fn unsubscribe(&self, subscription: SubscriptionHandle) -> Result<(), ChannelError>;

    /// Write a value and wait for the acknowledgement.
    async fn write(&self, handle: &ChannelHandle, value: ChannelValue) -> Result<(), ChannelError>;

    /// Read the current value.
    async fn read(&self, handle: &ChannelHandle) -> Result<ChannelValue, ChannelError>;
}

/// Connect with a hard upper bound on the wait.
///
/// Implementations are asked to honour `timeout` themselves; this wrapper makes
/// sure a misbehaving implementation cannot block the caller past it.
pub async fn connect_within(
    remote: &dyn RemoteChannel,
    name: &str,
    timeout: Duration,
) -> Result<ChannelHandle, ChannelError> {
    match tokio::time::timeout(timeout, remote.connect(name, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Timeout {
            name: name.to_string(),
            timeout,
        }),
    }
}

/// Connect a channel and write a single value to it.
pub async fn write_value(
    remote: &dyn RemoteChannel,
    name: &str,
    value: ChannelValue,
    timeout: Duration,
) -> Result<(), ChannelError> {
    let handle = connect_within(remote, name, timeout).await?;
    match tokio::time::timeout(timeout, remote.write(&handle, value)).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Write {
            name: name.to_string(),
            reason: format!("no acknowledgement within {timeout:?}"),
        }),
    }
}

/// Connect a channel and read its current value.
pub async fn read_value(
    remote: &dyn RemoteChannel,
    name: &str,
    timeout: Duration,
) -> Result<ChannelValue, ChannelError> {
    let handle = connect_within(remote, name, timeout).await?;
    match tokio::time::timeout(timeout, remote.read(&handle)).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::Read {
            name: name.to_string(),
            reason: format!("no value within {timeout:?}"),
        }),
    }
}
