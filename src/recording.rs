//! Live recording session: persist each incoming point, aggregate it and
//! keep the track's stored summary current.

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{info, warn};

use crate::aggregator::StatisticsAggregator;
use crate::config::StatisticsSettings;
use crate::database::Database;
use crate::error::{Result, TrackStatsError};
use crate::models::{Marker, MarkerId, Track, TrackId, TrackPoint, TrackPointId};
use crate::statistics::TrackStatistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Recording,
    Paused,
    Finished,
}

/// Records one track into a [`Database`]
pub struct TrackRecorder<'db> {
    db: &'db Database,
    track_id: TrackId,
    aggregator: StatisticsAggregator,
    /// Last raw point of the current segment; sensors report cumulative values
    sensor_baseline: Option<TrackPoint>,
    last_point: Option<TrackPoint>,
    persisted: TrackStatistics,
    state: RecordingState,
}

impl<'db> TrackRecorder<'db> {
    /// Stores `track` and opens its first segment at `time`
    pub fn start(
        db: &'db Database,
        track: &Track,
        settings: StatisticsSettings,
        time: DateTime<Utc>,
    ) -> Result<Self> {
        Self::start_with_marker(db, track, settings, TrackPoint::segment_start_manual(time))
    }

    /// Stores `track` and opens its first segment with `marker`, keeping any
    /// position or sensor readings it carries. Sensor values are cumulative
    /// as for [`record`](Self::record).
    pub fn start_with_marker(
        db: &'db Database,
        track: &Track,
        settings: StatisticsSettings,
        marker: TrackPoint,
    ) -> Result<Self> {
        if !marker.point_type.is_segment_start() {
            return Err(TrackStatsError::Internal(format!(
                "a recording must open with a segment start, got {:?}",
                marker.point_type
            )));
        }
        let track_id = db.insert_track(track)?;
        let mut recorder = Self {
            db,
            track_id,
            aggregator: StatisticsAggregator::new(settings),
            sensor_baseline: None,
            last_point: None,
            persisted: TrackStatistics::default(),
            state: RecordingState::Recording,
        };
        recorder.record_cumulative(marker)?;
        recorder.persist()?;
        info!(track_id = %track_id, "Recording started");
        Ok(recorder)
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    /// Live statistics including the point just recorded
    pub fn statistics(&self) -> TrackStatistics {
        self.aggregator.track_statistics()
    }

    /// Statistics as last written to the store
    pub fn persisted_statistics(&self) -> &TrackStatistics {
        &self.persisted
    }

    /// Records a sample whose sensor distance and barometric values are
    /// cumulative since the sensor was connected.
    ///
    /// A point that fails to be stored is not aggregated either.
    ///
    /// When only the summary update fails, the point stays recorded and the
    /// error is returned; the next successful call persists it.
    pub fn record(&mut self, raw: TrackPoint) -> Result<TrackPointId> {
        self.expect_state(RecordingState::Recording, "record")?;
        let id = self.record_cumulative(raw)?;
        self.persist()?;
        Ok(id)
    }

    /// Stores and aggregates `raw` relative to the sensor baseline, then moves
    /// the baseline to `raw`
    fn record_cumulative(&mut self, raw: TrackPoint) -> Result<TrackPointId> {
        let mut point = raw.clone();
        let baseline = self.sensor_baseline.as_ref().unwrap_or(&raw);
        point.minus_cumulative_sensor_data(baseline);

        let id = self.append_point(point)?;
        self.sensor_baseline = Some(raw);
        Ok(id)
    }

    /// Closes the current segment at `time`
    pub fn pause(&mut self, time: DateTime<Utc>) -> Result<()> {
        self.expect_state(RecordingState::Recording, "pause")?;
        self.append_point(TrackPoint::segment_end_manual(time))?;
        self.state = RecordingState::Paused;
        info!(track_id = %self.track_id, "Recording paused");
        self.persist()
    }

    /// Opens a new segment at `time`; sensor readings start from a new baseline
    pub fn resume(&mut self, time: DateTime<Utc>) -> Result<()> {
        self.expect_state(RecordingState::Paused, "resume")?;
        self.append_point(TrackPoint::segment_start_manual(time))?;
        self.sensor_baseline = None;
        self.state = RecordingState::Recording;
        info!(track_id = %self.track_id, "Recording resumed");
        self.persist()
    }

    /// Adds a marker at the position of the last recorded point
    pub fn add_marker(&self, name: &str, category: Option<&str>) -> Result<MarkerId> {
        let last = self
            .last_point
            .as_ref()
            .ok_or_else(|| TrackStatsError::Internal("no point recorded yet".to_string()))?;
        let marker = Marker {
            id: None,
            track_id: self.track_id,
            name: name.to_string(),
            description: None,
            category: category.map(str::to_string),
            time: last.time,
            latitude: last.latitude,
            longitude: last.longitude,
            altitude: last.altitude,
        };
        Ok(self.db.insert_marker(&marker)?)
    }

    /// Ends the recording at `time` and returns the final statistics
    pub fn finish(&mut self, time: DateTime<Utc>) -> Result<TrackStatistics> {
        match self.state {
            RecordingState::Recording => {
                self.append_point(TrackPoint::segment_end_manual(time))?;
            }
            RecordingState::Paused => {}
            RecordingState::Finished => {
                return Err(TrackStatsError::Internal("recording already finished".to_string()))
            }
        }
        self.state = RecordingState::Finished;
        self.persist()?;
        info!(
            track_id = %self.track_id,
            distance = self.persisted.total_distance(),
            "Recording finished"
        );
        Ok(self.persisted.clone())
    }

    fn expect_state(&self, expected: RecordingState, action: &str) -> Result<()> {
        if self.state != expected {
            return Err(TrackStatsError::Internal(format!(
                "cannot {} while {:?}",
                action, self.state
            )));
        }
        Ok(())
    }

    /// Validate, insert, aggregate; a point that fails to insert is not aggregated
    fn append_point(&mut self, point: TrackPoint) -> Result<TrackPointId> {
        let mut point = truncated_to_millis(point);
        self.aggregator.check_point(&point)?;
        let id = self.db.insert_track_point(self.track_id, &point)?;
        point.id = Some(id);
        self.last_point = Some(point.clone());
        self.aggregator.add_track_point(point)?;
        Ok(id)
    }

    fn persist(&mut self) -> Result<()> {
        let statistics = self.aggregator.track_statistics();
        match self.db.update_track_statistics(self.track_id, &statistics) {
            Ok(()) => {
                self.persisted = statistics;
                Ok(())
            }
            Err(err) => {
                warn!(track_id = %self.track_id, "Failed to persist track statistics: {}", err);
                Err(err.into())
            }
        }
    }
}

/// The store keeps millisecond times; aggregating the same times keeps live
/// and replayed statistics equal
fn truncated_to_millis(mut point: TrackPoint) -> TrackPoint {
    point.time = point.time.trunc_subsecs(3);
    point
}
