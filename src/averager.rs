//! Running averages for repeated acquisitions.
//!
//! In averaging mode a scan takes N samples of the same underlying measurement
//! and folds them into an exponentially weighted mean:
//!
//! ```text
//! value' = value * (1 - w) + sample * w
//! ```
//!
//! The first sample after a reset has nothing to blend with and is returned
//! unchanged.

use crate::device::DeviceId;
use std::collections::HashMap;

/// Default blend weight when none is configured.
pub const DEFAULT_WEIGHT: f64 = 0.5;

/// Exponentially weighted running mean of one measurement stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleAverager {
    weight: f64,
    value: Option<f64>,
    samples: u64,
}

impl SampleAverager {
    /// Create an averager with blend weight `w`.
    ///
    /// Weights outside `(0, 1)` are clamped into it; configuration validation
    /// rejects them before they get here.
    pub fn new(weight: f64) -> Self {
        let weight = if weight.is_finite() {
            weight.clamp(f64::EPSILON, 1.0 - f64::EPSILON)
        } else {
            DEFAULT_WEIGHT
        };
        Self {
            weight,
            value: None,
            samples: 0,
        }
    }

    /// Forget the current average.
    pub fn reset(&mut self) {
        self.value = None;
        self.samples = 0;
    }

    /// Fold in a new sample and return the current average.
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(value) => value * (1.0 - self.weight) + sample * self.weight,
        };
        self.value = Some(next);
        self.samples += 1;
        next
    }

    /// Current average, if any sample has been folded in.
    pub fn current(&self) -> Option<f64> {
        self.value
    }

    /// Samples folded in since the last reset.
    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// Configured blend weight.
    pub fn weight(&self) -> f64 {
        self.weight
    }
}

impl Default for SampleAverager {
    fn default() -> Self {
        Self::new(DEFAULT_WEIGHT)
    }
}

/// One averager per device stream, created on first use.
#[derive(Debug, Clone)]
pub struct AveragerBank {
    weight: f64,
    streams: HashMap<DeviceId, SampleAverager>,
}

impl AveragerBank {
    /// Create an empty bank whose averagers use weight `w`.
    pub fn new(weight: f64) -> Self {
        Self {
            weight,
            streams: HashMap::new(),
        }
    }

    /// Fold a sample into the stream for `device`.
    pub fn update(&mut self, device: &DeviceId, sample: f64) -> f64 {
        let weight = self.weight;
        self.streams
            .entry(device.clone())
            .or_insert_with(|| SampleAverager::new(weight))
            .update(sample)
    }

    /// Current average for `device`.
    pub fn current(&self, device: &DeviceId) -> Option<f64> {
        self.streams.get(device).and_then(SampleAverager::current)
    }

    /// Discard every stream.
    pub fn reset(&mut self) {
        self.streams.clear();
    }

    /// Number of streams with at least one sample.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether the bank holds no streams.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
