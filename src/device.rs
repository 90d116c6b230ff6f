//! Scan devices and their capabilities.
//!
//! Devices are supplied by the caller and only read by the orchestrator. Instead of
//! branching on the concrete hardware type, the orchestrator queries the
//! [`DeviceCapabilities`] of each device:
//!
//! - A profile scanner (`ProfileScanner`) moves a wire through the beam, so it can
//!   be parked and stopped.
//! - A wire harp (`WireHarp`) has fixed wires, so park/stop paths are disabled.
//!
//! Both variants expose the same process-value channels for progress, motion
//! status, scan command and samples.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Stable device identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Hardware class of a device, used for display and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Actuator-driven wire scanner
    ProfileScanner,
    /// Fixed-wire harp
    WireHarp,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::ProfileScanner => write!(f, "profile scanner"),
            DeviceClass::WireHarp => write!(f, "wire harp"),
        }
    }
}

/// Channel names ("handles") a device exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChannels {
    /// Scan progress position (integer step/sample counter)
    pub progress: String,
    /// Motion status code
    pub motion: String,
    /// Scan/acquire command
    pub command: String,
    /// Configured step/sample count
    pub steps: String,
    /// Latest acquired sample value
    pub sample: String,
    /// Abort command
    pub abort: String,
    /// Park command (actuators only)
    pub park: Option<String>,
    /// Stop command (actuators only)
    pub stop: Option<String>,
}

impl DeviceChannels {
    /// Standard channel layout for a device prefix, e.g. `WS01:Scan_Progress`.
    pub fn standard(prefix: &str, actuated: bool) -> Self {
        Self {
            progress: format!("{prefix}:Scan_Progress"),
            motion: format!("{prefix}:Motion_Status"),
            command: format!("{prefix}:Scan_Start"),
            steps: format!("{prefix}:Scan_Steps"),
            sample: format!("{prefix}:Sample"),
            abort: format!("{prefix}:Scan_Abort"),
            park: actuated.then(|| format!("{prefix}:Park")),
            stop: actuated.then(|| format!("{prefix}:Stop")),
        }
    }

    /// Every channel name declared by the device.
    pub fn all(&self) -> Vec<&str> {
        let mut names = vec![
            self.progress.as_str(),
            self.motion.as_str(),
            self.command.as_str(),
            self.steps.as_str(),
            self.sample.as_str(),
            self.abort.as_str(),
        ];
        names.extend(self.park.as_deref());
        names.extend(self.stop.as_deref());
        names
    }
}

/// Capability queries the orchestrator makes instead of type checks.
pub trait DeviceCapabilities: Send + Sync + fmt::Debug {
    /// Hardware class for display.
    fn class(&self) -> DeviceClass;

    /// Whether the device has an actuator that can be parked.
    fn supports_park(&self) -> bool;

    /// Whether in-progress motion can be stopped.
    fn supports_stop(&self) -> bool;

    /// Channels that must connect before the device counts as healthy.
    fn required_channels<'a>(&self, channels: &'a DeviceChannels) -> Vec<&'a str>;
}

/// Actuator-based wire scanner.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileScanner;

impl DeviceCapabilities for ProfileScanner {
    fn class(&self) -> DeviceClass {
        DeviceClass::ProfileScanner
    }

    fn supports_park(&self) -> bool {
        true
    }

    fn supports_stop(&self) -> bool {
        true
    }

    fn required_channels<'a>(&self, channels: &'a DeviceChannels) -> Vec<&'a str> {
        channels.all()
    }
}

/// Fixed-wire harp; no actuator.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireHarp;

impl DeviceCapabilities for WireHarp {
    fn class(&self) -> DeviceClass {
        DeviceClass::WireHarp
    }

    fn supports_park(&self) -> bool {
        false
    }

    fn supports_stop(&self) -> bool {
        false
    }

    fn required_channels<'a>(&self, channels: &'a DeviceChannels) -> Vec<&'a str> {
        vec![
            channels.progress.as_str(),
            channels.motion.as_str(),
            channels.command.as_str(),
            channels.steps.as_str(),
            channels.sample.as_str(),
            channels.abort.as_str(),
        ]
    }
}

/// One piece of hardware participating in a scan.
///
/// Equality and hashing use the identifier only.
#[derive(Debug, Clone)]
pub struct Device {
    id: DeviceId,
    capabilities: Arc<dyn DeviceCapabilities>,
    channels: DeviceChannels,
}

impl Device {
    /// Create a device with explicit capabilities and channels.
    pub fn new(
        id: impl Into<String>,
        capabilities: Arc<dyn DeviceCapabilities>,
        channels: DeviceChannels,
    ) -> Self {
        Self {
            id: DeviceId::new(id),
            capabilities,
            channels,
        }
    }

    /// Profile scanner using the standard channel layout under its id.
    pub fn profile_scanner(id: impl Into<String>) -> Self {
        let id = id.into();
        let channels = DeviceChannels::standard(&id, true);
        Self::new(id, Arc::new(ProfileScanner), channels)
    }

    /// Wire harp using the standard channel layout under its id.
    pub fn wire_harp(id: impl Into<String>) -> Self {
        let id = id.into();
        let channels = DeviceChannels::standard(&id, false);
        Self::new(id, Arc::new(WireHarp), channels)
    }

    /// Device identifier.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Declared channels.
    pub fn channels(&self) -> &DeviceChannels {
        &self.channels
    }

    /// Capability object.
    pub fn capabilities(&self) -> &dyn DeviceCapabilities {
        self.capabilities.as_ref()
    }

    /// Hardware class.
    pub fn class(&self) -> DeviceClass {
        self.capabilities.class()
    }

    /// Shorthand for `capabilities().supports_park()`.
    pub fn supports_park(&self) -> bool {
        self.capabilities.supports_park()
    }

    /// Shorthand for `capabilities().supports_stop()`.
    pub fn supports_stop(&self) -> bool {
        self.capabilities.supports_stop()
    }

    /// Channels checked by the connection health check.
    pub fn required_channels(&self) -> Vec<&str> {
        self.capabilities.required_channels(&self.channels)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.class())
    }
}
