//! Recomputing statistics from stored points.

use tracing::{debug, info, info_span};

use crate::aggregator::StatisticsAggregator;
use crate::config::StatisticsSettings;
use crate::database::{Database, PointStore, ScanDirection};
use crate::error::Result;
use crate::iterator::PagedPointIterator;
use crate::models::{TrackId, TrackPoint};
use crate::statistics::TrackStatistics;

/// Replays every point of a track, oldest first, through a fresh aggregator
pub fn replay_track<S: PointStore + ?Sized>(
    store: &S,
    track_id: TrackId,
    settings: StatisticsSettings,
    page_size: usize,
) -> Result<TrackStatistics> {
    replay_track_with_progress(store, track_id, settings, page_size, |_| {})
}

/// Like [`replay_track`], calling `on_point` after each aggregated point
pub fn replay_track_with_progress<S, F>(
    store: &S,
    track_id: TrackId,
    settings: StatisticsSettings,
    page_size: usize,
    mut on_point: F,
) -> Result<TrackStatistics>
where
    S: PointStore + ?Sized,
    F: FnMut(&TrackPoint),
{
    let _span = info_span!("replay", track_id = %track_id).entered();

    let mut aggregator = StatisticsAggregator::new(settings);
    let mut points =
        PagedPointIterator::new(store, track_id, None, ScanDirection::Ascending, page_size);
    let mut count = 0usize;

    for point in points.by_ref() {
        let point = point?;
        on_point(&point);
        aggregator.add_track_point(point)?;
        count += 1;
    }
    points.close();

    debug!(points = count, pages = points.pages_fetched(), "Replay finished");
    Ok(aggregator.track_statistics())
}

/// Replays a stored track and persists the result as its summary
pub fn recompute_track_statistics(
    db: &Database,
    track_id: TrackId,
    settings: StatisticsSettings,
    page_size: usize,
) -> Result<TrackStatistics> {
    // fail early for unknown tracks rather than persisting nothing
    db.get_track(track_id)?;
    let statistics = replay_track(db, track_id, settings, page_size)?;
    db.update_track_statistics(track_id, &statistics)?;
    info!(
        track_id = %track_id,
        distance = statistics.total_distance(),
        "Recomputed track statistics"
    );
    Ok(statistics)
}

/// Follows a track that is still being written, aggregating new points as
/// they appear in the store
pub struct TrackFollower<'a, S: PointStore + ?Sized> {
    points: PagedPointIterator<'a, S>,
    aggregator: StatisticsAggregator,
}

impl<'a, S: PointStore + ?Sized> TrackFollower<'a, S> {
    pub fn new(store: &'a S, track_id: TrackId, settings: StatisticsSettings, page_size: usize) -> Self {
        Self {
            points: PagedPointIterator::new(store, track_id, None, ScanDirection::Ascending, page_size),
            aggregator: StatisticsAggregator::new(settings),
        }
    }

    /// Aggregates all points stored since the previous poll, returning how many were added
    pub fn poll(&mut self) -> Result<usize> {
        self.points.refresh();
        let mut added = 0;
        while self.points.has_next()? {
            let point = self.points.next_point()?;
            self.aggregator.add_track_point(point)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn statistics(&self) -> TrackStatistics {
        self.aggregator.track_statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackStatsError;
    use crate::models::Track;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_replay_matches_live_aggregation() {
        let mut db = Database::open_in_memory().unwrap();
        let track_id = db.insert_track(&Track::new("Loop")).unwrap();
        let points: Vec<TrackPoint> = std::iter::once(TrackPoint::segment_start_manual(at(0)))
            .chain((1..=20).map(|i| {
                TrackPoint::sample(at(i * 5))
                    .with_location(45.0 + i as f64 * 0.0001, 7.0)
                    .with_speed(2.5)
                    .with_altitude(300.0 + i as f64)
            }))
            .collect();
        db.insert_track_points(track_id, &points).unwrap();

        let mut live = StatisticsAggregator::default();
        live.add_track_points(points).unwrap();

        let replayed = replay_track(&db, track_id, StatisticsSettings::default(), 7).unwrap();
        let expected = live.track_statistics();

        assert_eq!(replayed.moving_time(), expected.moving_time());
        assert_eq!(replayed.total_time(), Duration::from_secs(100));
        assert!((replayed.total_distance() - expected.total_distance()).abs() < 1e-6);
        assert_eq!(replayed.max_altitude(), expected.max_altitude());
    }

    #[test]
    fn test_recompute_persists_summary() {
        let mut db = Database::open_in_memory().unwrap();
        let track_id = db.insert_track(&Track::new("Commute")).unwrap();
        db.insert_track_points(
            track_id,
            &[
                TrackPoint::sample(at(0)).with_speed(3.0),
                TrackPoint::sample(at(60)).with_speed(3.0).with_sensor_distance(180.0),
            ],
        )
        .unwrap();

        let stats = recompute_track_statistics(&db, track_id, StatisticsSettings::default(), 100).unwrap();
        let stored = db.get_track(track_id).unwrap();

        assert_eq!(stored.statistics, stats);
        assert_eq!(stats.total_distance(), 180.0);
        assert_eq!(stats.moving_time(), Duration::from_secs(60));
    }

    #[test]
    fn test_recompute_unknown_track() {
        let db = Database::open_in_memory().unwrap();
        let err = recompute_track_statistics(&db, TrackId(5), StatisticsSettings::default(), 10)
            .unwrap_err();
        assert!(matches!(err, TrackStatsError::Database(_)));
    }

    #[test]
    fn test_follower_picks_up_new_points() {
        let db = Database::open_in_memory().unwrap();
        let track_id = db.insert_track(&Track::new("Live")).unwrap();
        db.insert_track_point(track_id, &TrackPoint::segment_start_manual(at(0)))
            .unwrap();
        db.insert_track_point(track_id, &TrackPoint::sample(at(10)).with_speed(2.0))
            .unwrap();

        let mut follower = TrackFollower::new(&db, track_id, StatisticsSettings::default(), 50);
        assert_eq!(follower.poll().unwrap(), 2);
        assert_eq!(follower.poll().unwrap(), 0);

        db.insert_track_point(track_id, &TrackPoint::sample(at(20)).with_speed(2.0))
            .unwrap();
        assert_eq!(follower.poll().unwrap(), 1);
        assert_eq!(follower.statistics().moving_time(), Duration::from_secs(10));
    }
}
