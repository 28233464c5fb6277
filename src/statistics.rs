//! Derived metrics over a contiguous time range of a track.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AggregationError;
use crate::extremity::ExtremityMonitor;

/// Duration-weighted running mean of a rate quantity (heart rate, cadence, power)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedAverage {
    pub average: f64,
    /// Total duration the average covers
    pub weight: Duration,
}

impl WeightedAverage {
    pub fn new(average: f64, weight: Duration) -> Self {
        Self { average, weight }
    }

    /// Folds in a sample that was valid for `delta`
    pub fn add_sample(&mut self, sample: f64, delta: Duration) {
        let old_weight = self.weight.as_secs_f64();
        let delta_weight = delta.as_secs_f64();
        let total = old_weight + delta_weight;
        if total == 0.0 {
            // no time has passed yet; the latest reading is the best estimate
            self.average = sample;
            return;
        }
        self.average = (old_weight * self.average + delta_weight * sample) / total;
        self.weight += delta;
    }

    /// Combines two averages over disjoint ranges; `later` wins when neither carries weight
    pub fn combine(self, later: WeightedAverage) -> WeightedAverage {
        let total = self.weight + later.weight;
        if total.is_zero() {
            return later;
        }
        let average = (self.weight.as_secs_f64() * self.average
            + later.weight.as_secs_f64() * later.average)
            / total.as_secs_f64();
        WeightedAverage::new(average, total)
    }
}

/// Aggregated statistics of a track or of one of its segments.
///
/// Two instances covering disjoint, chronologically ordered ranges combine
/// with [`merge`](Self::merge) without losing extremes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackStatistics {
    pub(crate) start_time: Option<DateTime<Utc>>,
    pub(crate) stop_time: Option<DateTime<Utc>>,
    /// Meters
    pub(crate) total_distance: f64,
    pub(crate) total_time: Duration,
    pub(crate) moving_time: Duration,
    /// Meters per second
    pub(crate) max_speed: f64,
    /// Smoothed altitude range in meters
    pub(crate) altitude_extremities: ExtremityMonitor,
    pub(crate) total_altitude_gain: Option<f64>,
    pub(crate) total_altitude_loss: Option<f64>,
    pub(crate) avg_heart_rate: Option<WeightedAverage>,
    pub(crate) avg_cadence: Option<WeightedAverage>,
    pub(crate) avg_power: Option<WeightedAverage>,
    pub(crate) is_idle: bool,
}

impl TrackStatistics {
    /// Empty statistics whose range starts and stops at `time`
    pub fn anchored(time: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(time),
            stop_time: Some(time),
            ..Self::default()
        }
    }

    /// True once a start time has been set
    pub fn is_initialized(&self) -> bool {
        self.start_time.is_some()
    }

    /// Returns the combination of `self` followed by `later`.
    ///
    /// Assumes the two ranges do not intersect.
    pub fn merge(&self, later: &TrackStatistics) -> TrackStatistics {
        let mut merged = self.clone();
        merged.merge_from(later);
        merged
    }

    pub(crate) fn merge_from(&mut self, later: &TrackStatistics) {
        self.start_time = match (self.start_time, later.start_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.stop_time = match (self.stop_time, later.stop_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.total_distance += later.total_distance;
        self.total_time += later.total_time;
        self.moving_time += later.moving_time;
        self.max_speed = self.max_speed.max(later.max_speed);
        self.altitude_extremities.merge(&later.altitude_extremities);
        self.total_altitude_gain = add_optional(self.total_altitude_gain, later.total_altitude_gain);
        self.total_altitude_loss = add_optional(self.total_altitude_loss, later.total_altitude_loss);
        self.avg_heart_rate = combine_optional(self.avg_heart_rate, later.avg_heart_rate);
        self.avg_cadence = combine_optional(self.avg_cadence, later.avg_cadence);
        self.avg_power = combine_optional(self.avg_power, later.avg_power);
        self.is_idle = later.is_idle;
    }

    /// Moves the stop time forward to `time`, initializing the range on first use
    pub(crate) fn extend_to(&mut self, time: DateTime<Utc>) -> Result<(), AggregationError> {
        let start = match (self.start_time, self.stop_time) {
            (Some(start), Some(stop)) => {
                if time < stop {
                    return Err(AggregationError::NonMonotonicTime {
                        previous: stop,
                        current: time,
                    });
                }
                start
            }
            _ => {
                self.start_time = Some(time);
                time
            }
        };
        self.total_time = elapsed(start, time)?;
        self.stop_time = Some(time);
        Ok(())
    }

    pub(crate) fn add_altitude_gain(&mut self, gain: f64) {
        self.total_altitude_gain = Some(self.total_altitude_gain.unwrap_or(0.0) + gain);
    }

    pub(crate) fn add_altitude_loss(&mut self, loss: f64) {
        self.total_altitude_loss = Some(self.total_altitude_loss.unwrap_or(0.0) + loss);
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn stop_time(&self) -> Option<DateTime<Utc>> {
        self.stop_time
    }

    /// Total distance in meters
    pub fn total_distance(&self) -> f64 {
        self.total_distance
    }

    /// Time between start and stop of every merged range, pauses excluded
    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn moving_time(&self) -> Duration {
        self.moving_time
    }

    /// Average speed in m/s over the total time
    pub fn average_speed(&self) -> f64 {
        if self.total_time.is_zero() {
            return 0.0;
        }
        self.total_distance / self.total_time.as_secs_f64()
    }

    /// Average speed in m/s over the moving time
    pub fn average_moving_speed(&self) -> f64 {
        if self.moving_time.is_zero() {
            return 0.0;
        }
        self.total_distance / self.moving_time.as_secs_f64()
    }

    /// Maximum speed in m/s; never below the average moving speed
    pub fn max_speed(&self) -> f64 {
        self.max_speed.max(self.average_moving_speed())
    }

    pub fn min_altitude(&self) -> Option<f64> {
        self.altitude_extremities.min_opt()
    }

    pub fn max_altitude(&self) -> Option<f64> {
        self.altitude_extremities.max_opt()
    }

    pub fn altitude_extremities(&self) -> &ExtremityMonitor {
        &self.altitude_extremities
    }

    pub fn total_altitude_gain(&self) -> Option<f64> {
        self.total_altitude_gain
    }

    pub fn total_altitude_loss(&self) -> Option<f64> {
        self.total_altitude_loss
    }

    pub fn average_heart_rate(&self) -> Option<f64> {
        self.avg_heart_rate.map(|avg| avg.average)
    }

    pub fn average_cadence(&self) -> Option<f64> {
        self.avg_cadence.map(|avg| avg.average)
    }

    pub fn average_power(&self) -> Option<f64> {
        self.avg_power.map(|avg| avg.average)
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }
}

/// Non-negative duration between two instants
pub(crate) fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Duration, AggregationError> {
    (to - from)
        .to_std()
        .map_err(|_| AggregationError::NegativeDuration { from, to })
}

fn add_optional(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

fn combine_optional(a: Option<WeightedAverage>, b: Option<WeightedAverage>) -> Option<WeightedAverage> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.combine(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn range(start: i64, stop: i64, distance: f64, altitude: (f64, f64)) -> TrackStatistics {
        let mut stats = TrackStatistics::anchored(at(start));
        stats.extend_to(at(stop)).unwrap();
        stats.total_distance = distance;
        stats.moving_time = Duration::from_secs(((stop - start) / 2) as u64);
        stats.altitude_extremities.update(altitude.0);
        stats.altitude_extremities.update(altitude.1);
        stats
    }

    #[test]
    fn test_weighted_average_online_update() {
        let mut avg = WeightedAverage::new(0.0, Duration::ZERO);
        avg.add_sample(100.0, Duration::from_secs(10));
        assert_relative_eq!(avg.average, 100.0);
        avg.add_sample(130.0, Duration::from_secs(20));
        assert_relative_eq!(avg.average, 120.0);
        assert_eq!(avg.weight, Duration::from_secs(30));
    }

    #[test]
    fn test_weighted_average_zero_delta_takes_latest() {
        let mut avg = WeightedAverage::new(90.0, Duration::ZERO);
        avg.add_sample(95.0, Duration::ZERO);
        assert_relative_eq!(avg.average, 95.0);
        assert!(avg.weight.is_zero());
    }

    #[test]
    fn test_merge_combines_ranges() {
        let first = range(0, 100, 500.0, (10.0, 20.0));
        let mut second = range(200, 260, 300.0, (5.0, 15.0));
        second.max_speed = 7.5;

        let merged = first.merge(&second);

        assert_eq!(merged.start_time(), Some(at(0)));
        assert_eq!(merged.stop_time(), Some(at(260)));
        assert_eq!(merged.total_time(), Duration::from_secs(160));
        assert_eq!(merged.moving_time(), Duration::from_secs(80));
        assert_relative_eq!(merged.total_distance(), 800.0);
        assert_eq!(merged.min_altitude(), Some(5.0));
        assert_eq!(merged.max_altitude(), Some(20.0));
        assert_relative_eq!(merged.max_speed(), 10.0); // 800 m / 80 s
        // inputs untouched
        assert_relative_eq!(first.total_distance(), 500.0);
    }

    #[test]
    fn test_merge_time_weights_heart_rate() {
        let mut first = range(0, 60, 0.0, (0.0, 0.0));
        first.avg_heart_rate = Some(WeightedAverage::new(100.0, Duration::from_secs(60)));
        let mut second = range(60, 240, 0.0, (0.0, 0.0));
        second.avg_heart_rate = Some(WeightedAverage::new(140.0, Duration::from_secs(180)));

        let merged = first.merge(&second);
        assert_relative_eq!(merged.average_heart_rate().unwrap(), 130.0);

        let without = range(240, 300, 0.0, (0.0, 0.0));
        assert_relative_eq!(merged.merge(&without).average_heart_rate().unwrap(), 130.0);
    }

    #[test]
    fn test_merge_with_uninitialized() {
        let first = range(10, 20, 1.0, (1.0, 2.0));
        let merged = TrackStatistics::default().merge(&first);
        assert_eq!(merged.start_time(), Some(at(10)));
        assert_eq!(merged.total_altitude_gain(), None);
    }

    #[test]
    fn test_extend_to_rejects_earlier_time() {
        let mut stats = TrackStatistics::anchored(at(100));
        stats.extend_to(at(150)).unwrap();
        let err = stats.extend_to(at(120)).unwrap_err();
        assert_eq!(
            err,
            AggregationError::NonMonotonicTime {
                previous: at(150),
                current: at(120)
            }
        );
        assert_eq!(stats.stop_time(), Some(at(150)));
        assert_eq!(stats.total_time(), Duration::from_secs(50));
    }

    #[test]
    fn test_empty_speeds_are_zero() {
        let stats = TrackStatistics::default();
        assert_eq!(stats.average_speed(), 0.0);
        assert_eq!(stats.average_moving_speed(), 0.0);
        assert_eq!(stats.max_speed(), 0.0);
        assert!(!stats.is_initialized());
    }
}
