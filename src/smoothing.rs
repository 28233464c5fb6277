//! Fixed-capacity sliding window averaging for a single scalar channel.

use serde::{Deserialize, Serialize};

/// Conversion between a channel value and the scalar used for averaging
pub trait Smoothable: Copy {
    fn to_scalar(self) -> f64;
    fn from_scalar(value: f64) -> Self;
}

impl Smoothable for f64 {
    fn to_scalar(self) -> f64 {
        self
    }

    fn from_scalar(value: f64) -> Self {
        value
    }
}

impl Smoothable for f32 {
    fn to_scalar(self) -> f64 {
        self as f64
    }

    fn from_scalar(value: f64) -> Self {
        value as f32
    }
}

/// Integer sensor channels (e.g. heart rate in bpm) round to the nearest unit
impl Smoothable for u16 {
    fn to_scalar(self) -> f64 {
        self as f64
    }

    fn from_scalar(value: f64) -> Self {
        value.round().clamp(0.0, u16::MAX as f64) as u16
    }
}

/// Ring buffer holding the last `capacity` samples of a channel.
///
/// Once full, each [`set_next`](Self::set_next) overwrites the oldest sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingBuffer<T> {
    samples: Vec<T>,
    capacity: usize,
    next_index: usize,
}

impl<T: Smoothable> SmoothingBuffer<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "smoothing buffer capacity must be positive");
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            next_index: 0,
        }
    }

    pub fn set_next(&mut self, value: T) {
        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            self.samples[self.next_index] = value;
        }
        self.next_index = (self.next_index + 1) % self.capacity;
    }

    /// Mean of the held samples, `None` while empty
    pub fn average(&self) -> Option<T> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(|s| s.to_scalar()).sum();
        Some(T::from_scalar(sum / self.samples.len() as f64))
    }

    pub fn has_data(&self) -> bool {
        !self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.next_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_empty_buffer_has_no_average() {
        let buffer: SmoothingBuffer<f64> = SmoothingBuffer::new(3);
        assert!(!buffer.has_data());
        assert_eq!(buffer.average(), None);
    }

    #[test]
    fn test_overwrites_oldest_sample() {
        let mut buffer = SmoothingBuffer::new(3);
        for value in [1.0, 2.0, 3.0, 4.0] {
            buffer.set_next(value);
        }
        // holds [2, 3, 4]
        assert_relative_eq!(buffer.average().unwrap(), 3.0);
        assert!(buffer.is_full());
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_partial_window_average() {
        let mut buffer = SmoothingBuffer::new(25);
        buffer.set_next(10.0);
        buffer.set_next(12.0);
        assert!(!buffer.is_full());
        assert_relative_eq!(buffer.average().unwrap(), 11.0);
    }

    #[test]
    fn test_integer_channel_rounds() {
        let mut buffer: SmoothingBuffer<u16> = SmoothingBuffer::new(2);
        buffer.set_next(120);
        buffer.set_next(125);
        assert_eq!(buffer.average(), Some(123));
    }

    #[test]
    fn test_reset() {
        let mut buffer = SmoothingBuffer::new(2);
        buffer.set_next(1.0f32);
        buffer.reset();
        assert!(buffer.is_empty());
        buffer.set_next(5.0);
        assert_relative_eq!(buffer.average().unwrap(), 5.0);
    }
}
