//! Incremental statistics over a chronologically ordered stream of track points.
//!
//! Points are folded into the statistics of the current segment. Segment
//! boundaries (start and end markers) fold the segment into the running track
//! total, so pauses never count towards total or moving time.

use std::time::Duration;
use tracing::{debug, trace};

use crate::config::{StatisticsSettings, RECEIVER_ERROR_SPEED_MPS};
use crate::error::AggregationError;
use crate::models::{TrackPoint, TrackPointType};
use crate::smoothing::SmoothingBuffer;
use crate::statistics::{elapsed, TrackStatistics, WeightedAverage};

/// Stateful accumulator turning track points into [`TrackStatistics`].
///
/// Owned by a single recording or replay. A snapshot is taken with
/// [`track_statistics`](Self::track_statistics) at any time.
#[derive(Debug)]
pub struct StatisticsAggregator {
    settings: StatisticsSettings,
    track_statistics: TrackStatistics,
    current_segment: TrackStatistics,
    last_sample: Option<TrackPoint>,
    last_time: Option<chrono::DateTime<chrono::Utc>>,
    altitude_buffer: SmoothingBuffer<f64>,
}

impl Default for StatisticsAggregator {
    fn default() -> Self {
        Self::new(StatisticsSettings::default())
    }
}

impl StatisticsAggregator {
    pub fn new(settings: StatisticsSettings) -> Self {
        Self {
            altitude_buffer: SmoothingBuffer::new(settings.altitude_smoothing_window.max(1)),
            settings,
            track_statistics: TrackStatistics::default(),
            current_segment: TrackStatistics::default(),
            last_sample: None,
            last_time: None,
        }
    }

    /// Rejects a point that would break chronological order, without mutating
    pub fn check_point(&self, point: &TrackPoint) -> Result<(), AggregationError> {
        match self.last_time {
            Some(previous) if point.time < previous => Err(AggregationError::NonMonotonicTime {
                previous,
                current: point.time,
            }),
            _ => Ok(()),
        }
    }

    /// Folds one point into the statistics.
    ///
    /// On error nothing has been changed.
    pub fn add_track_point(&mut self, point: TrackPoint) -> Result<(), AggregationError> {
        self.check_point(&point)?;

        match point.point_type {
            TrackPointType::SegmentStartManual | TrackPointType::SegmentStartAutomatic => {
                self.last_time = Some(point.time);
                self.start_new_segment(&point);
                self.add_sample(point)
            }
            TrackPointType::SegmentEndManual => {
                // the segment lasts until the pause, not until its last sample
                let mut closing = self.current_segment.clone();
                if closing.is_initialized() {
                    closing.extend_to(point.time)?;
                }
                self.current_segment = closing;
                self.last_time = Some(point.time);
                self.start_new_segment(&point);
                Ok(())
            }
            TrackPointType::TrackPoint | TrackPointType::Idle => {
                self.add_sample(point)?;
                Ok(())
            }
        }
    }

    /// Folds points in order, stopping at the first rejected one
    pub fn add_track_points<I>(&mut self, points: I) -> Result<(), AggregationError>
    where
        I: IntoIterator<Item = TrackPoint>,
    {
        points
            .into_iter()
            .try_for_each(|point| self.add_track_point(point))
    }

    /// Statistics of everything added so far, the open segment included
    pub fn track_statistics(&self) -> TrackStatistics {
        self.track_statistics.merge(&self.current_segment)
    }

    /// Smoothed altitude of the open segment
    pub fn smoothed_altitude(&self) -> Option<f64> {
        self.altitude_buffer.average()
    }

    fn start_new_segment(&mut self, boundary: &TrackPoint) {
        if self.current_segment.is_initialized() {
            debug!(
                at = %boundary.time,
                distance = self.current_segment.total_distance(),
                "Closing segment"
            );
            self.track_statistics.merge_from(&self.current_segment);
        }
        self.current_segment = TrackStatistics::anchored(boundary.time);
        self.last_sample = None;
        self.altitude_buffer.reset();
    }

    fn add_sample(&mut self, point: TrackPoint) -> Result<(), AggregationError> {
        // All fallible work happens before the first mutation
        let since_last = match &self.last_sample {
            Some(last) => Some(elapsed(last.time, point.time)?),
            None => None,
        };
        let mut segment = self.current_segment.clone();
        segment.extend_to(point.time)?;

        let threshold = self.settings.moving_speed_threshold_mps;
        segment.is_idle = point.point_type == TrackPointType::Idle;

        let has_barometric = point.altitude_gain.is_some() || point.altitude_loss.is_some();
        if let Some(gain) = point.altitude_gain {
            segment.add_altitude_gain(gain);
        }
        if let Some(loss) = point.altitude_loss {
            segment.add_altitude_loss(loss);
        }

        if let Some(altitude) = point.altitude {
            let previous_smoothed = self.altitude_buffer.average();
            self.altitude_buffer.set_next(altitude);
            if let Some(smoothed) = self.altitude_buffer.average() {
                segment.altitude_extremities.update(smoothed);
                if let (false, Some(previous)) = (has_barometric, previous_smoothed) {
                    let change = smoothed - previous;
                    segment.add_altitude_gain(change.max(0.0));
                    segment.add_altitude_loss((-change).max(0.0));
                }
            }
        }

        if let Some(delta) = since_last {
            accumulate(&mut segment.avg_heart_rate, point.heart_rate, delta);
            accumulate(&mut segment.avg_cadence, point.cadence, delta);
            accumulate(&mut segment.avg_power, point.power, delta);
        }

        if let Some(distance) = point.sensor_distance {
            segment.total_distance += distance;
        } else if let Some(last) = &self.last_sample {
            if point.is_moving(threshold) {
                if let Some(distance) = point.distance_to_previous_from_location(last) {
                    segment.total_distance += distance;
                }
            }
        }

        if let (Some(last), Some(delta)) = (&self.last_sample, since_last) {
            if point.is_moving(threshold) && last.is_moving(threshold) {
                segment.moving_time += delta;
                if let Some(speed) = self.plausible_speed(&point, last, delta) {
                    segment.max_speed = segment.max_speed.max(speed);
                }
            }
        }

        trace!(time = %point.time, kind = ?point.point_type, "Sample aggregated");

        self.current_segment = segment;
        self.last_time = Some(point.time);
        self.last_sample = Some(point);
        Ok(())
    }

    /// Reported speed of `point`, unless it is a receiver error code or implies
    /// an implausible acceleration since `last`
    fn plausible_speed(&self, point: &TrackPoint, last: &TrackPoint, delta: Duration) -> Option<f64> {
        let speed = point.speed?;
        if (speed - RECEIVER_ERROR_SPEED_MPS).abs() < 1.0 {
            debug!(speed, time = %point.time, "Ignoring receiver error speed");
            return None;
        }
        let last_speed = last.speed.unwrap_or(0.0);
        let max_change = self.settings.max_acceleration_mps2 * delta.as_secs_f64();
        if (speed - last_speed).abs() > max_change {
            debug!(speed, last_speed, time = %point.time, "Ignoring implausible acceleration");
            return None;
        }
        Some(speed)
    }
}

fn accumulate(average: &mut Option<WeightedAverage>, sample: Option<f64>, delta: Duration) {
    let Some(sample) = sample else { return };
    match average {
        Some(avg) => avg.add_sample(sample, delta),
        None => *average = Some(WeightedAverage::new(sample, delta)),
    }
}
