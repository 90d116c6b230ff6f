//! Scan requests.

use crate::device::Device;
use crate::error::{AppResult, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Where device scan parameters come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParameterMode {
    /// Overwrite device settings with the requested step count
    #[default]
    Defaults,
    /// Leave the device's current configuration untouched
    CurrentConfiguration,
}

/// What a new sample means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcquisitionMode {
    /// One sample per actuator position
    #[default]
    StepScan,
    /// Repeated samples of the same measurement folded into a running mean
    Averaging,
}

/// Combined mode flags of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanMode {
    /// Parameter source
    pub parameters: ParameterMode,
    /// Acquisition semantics
    pub acquisition: AcquisitionMode,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parameters = match self.parameters {
            ParameterMode::Defaults => "default parameters",
            ParameterMode::CurrentConfiguration => "current configuration",
        };
        let acquisition = match self.acquisition {
            AcquisitionMode::StepScan => "step scan",
            AcquisitionMode::Averaging => "averaging",
        };
        write!(f, "{acquisition}, {parameters}")
    }
}

/// One scan invocation. Consumed by `ScanOrchestrator::start`.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    devices: Vec<Device>,
    steps: i64,
    mode: ScanMode,
}

impl ScanRequest {
    /// Request a step scan with default parameters.
    pub fn new(devices: Vec<Device>, steps: i64) -> Self {
        Self {
            devices,
            steps,
            mode: ScanMode::default(),
        }
    }

    /// Set the parameter mode.
    pub fn with_parameter_mode(mut self, mode: ParameterMode) -> Self {
        self.mode.parameters = mode;
        self
    }

    /// Set the acquisition mode.
    pub fn with_acquisition_mode(mut self, mode: AcquisitionMode) -> Self {
        self.mode.acquisition = mode;
        self
    }

    /// Requested devices.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Requested step/sample count.
    pub fn steps(&self) -> i64 {
        self.steps
    }

    /// Mode flags.
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Check the request and return the step count as the tracker maximum.
    ///
    /// # Errors
    ///
    /// [`ScanError::InvalidRequest`] for an empty device set, duplicate device
    /// ids, or a step count outside `1..=u32::MAX`.
    pub fn validate(&self) -> AppResult<u32> {
        if self.devices.is_empty() {
            return Err(ScanError::InvalidRequest("device set is empty".into()));
        }
        validate_unique(&self.devices)?;
        if self.steps <= 0 {
            return Err(ScanError::InvalidRequest(format!(
                "step count must be positive, got {}",
                self.steps
            )));
        }
        u32::try_from(self.steps).map_err(|_| {
            ScanError::InvalidRequest(format!("step count {} is too large", self.steps))
        })
    }
}

pub(crate) fn validate_unique(devices: &[Device]) -> AppResult<()> {
    let mut seen = HashSet::new();
    for device in devices {
        if !seen.insert(device.id()) {
            return Err(ScanError::InvalidRequest(format!(
                "duplicate device '{}'",
                device.id()
            )));
        }
    }
    Ok(())
}
