use serde::{Deserialize, Serialize};

/// Running minimum and maximum of a scalar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "ExtremityRange", into = "ExtremityRange")]
pub struct ExtremityMonitor {
    min: f64,
    max: f64,
}

/// Serialized form; infinite bounds are not representable in JSON
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ExtremityRange {
    min: Option<f64>,
    max: Option<f64>,
}

impl From<ExtremityMonitor> for ExtremityRange {
    fn from(monitor: ExtremityMonitor) -> Self {
        Self {
            min: monitor.min_opt(),
            max: monitor.max_opt(),
        }
    }
}

impl From<ExtremityRange> for ExtremityMonitor {
    fn from(range: ExtremityRange) -> Self {
        let mut monitor = ExtremityMonitor::new();
        if let (Some(min), Some(max)) = (range.min, range.max) {
            monitor.set(min, max);
        }
        monitor
    }
}

impl Default for ExtremityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtremityMonitor {
    pub fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Returns true if either bound moved
    pub fn update(&mut self, value: f64) -> bool {
        let mut changed = false;
        if value < self.min {
            self.min = value;
            changed = true;
        }
        if value > self.max {
            self.max = value;
            changed = true;
        }
        changed
    }

    pub fn has_data(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    /// `+inf` until the first update
    pub fn min(&self) -> f64 {
        self.min
    }

    /// `-inf` until the first update
    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn min_opt(&self) -> Option<f64> {
        self.has_data().then_some(self.min)
    }

    pub fn max_opt(&self) -> Option<f64> {
        self.has_data().then_some(self.max)
    }

    pub fn set(&mut self, min: f64, max: f64) {
        self.min = min;
        self.max = max;
    }

    /// Widens these bounds by another monitor's bounds
    pub fn merge(&mut self, other: &ExtremityMonitor) {
        if other.has_data() {
            self.update(other.min);
            self.update(other.max);
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
