use approx::assert_relative_eq;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::time::Duration;
use tempfile::tempdir;

use trackstats::{
    replay_track, Database, PagedPointIterator, RecordingState, StatisticsSettings, Track,
    TrackPoint, TrackPointType, TrackRecorder, TrackStatsError,
};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_710_000_000 + secs, 0).unwrap()
}

#[test]
fn test_recording_with_pause_matches_replay() {
    let db = Database::open_in_memory().unwrap();
    let settings = StatisticsSettings::default();
    let mut recorder =
        TrackRecorder::start(&db, &Track::new("Morning ride").with_activity_type("cycling"), settings, at(0))
            .unwrap();
    let track_id = recorder.track_id();

    for (secs, cumulative) in [(0, 0.0), (10, 60.0), (20, 125.0)] {
        recorder
            .record(TrackPoint::sample(at(secs)).with_speed(6.0).with_sensor_distance(cumulative))
            .unwrap();
    }
    recorder.pause(at(25)).unwrap();
    assert_eq!(recorder.state(), RecordingState::Paused);

    // the sensor restarted its counter while paused
    recorder.resume(at(60)).unwrap();
    for (secs, cumulative) in [(60, 10.0), (70, 70.0)] {
        recorder
            .record(TrackPoint::sample(at(secs)).with_speed(6.0).with_sensor_distance(cumulative))
            .unwrap();
    }
    let live = recorder.finish(at(75)).unwrap();

    assert_relative_eq!(live.total_distance(), 185.0);
    assert_eq!(live.moving_time(), Duration::from_secs(30));
    // 25 s before the pause and 15 s after it
    assert_eq!(live.total_time(), Duration::from_secs(40));

    let stored = db.get_track(track_id).unwrap();
    assert_eq!(stored.name, "Morning ride");
    assert_eq!(stored.statistics, live);

    let replayed = replay_track(&db, track_id, settings, 3).unwrap();
    assert_eq!(replayed, live);
}

#[test]
fn test_rejected_point_is_not_stored() {
    let db = Database::open_in_memory().unwrap();
    let mut recorder =
        TrackRecorder::start(&db, &Track::new("Run"), StatisticsSettings::default(), at(0)).unwrap();
    recorder.record(TrackPoint::sample(at(30)).with_speed(3.0)).unwrap();
    let before = recorder.statistics();

    let err = recorder.record(TrackPoint::sample(at(10)).with_speed(3.0)).unwrap_err();

    assert!(matches!(err, TrackStatsError::Aggregation(_)));
    assert_eq!(db.count_track_points(recorder.track_id()).unwrap(), 2);
    assert_eq!(recorder.statistics(), before);
    assert_eq!(recorder.persisted_statistics(), &before);
}

#[test]
fn test_marker_uses_last_position() {
    let db = Database::open_in_memory().unwrap();
    let mut recorder =
        TrackRecorder::start(&db, &Track::new("Hike"), StatisticsSettings::default(), at(0)).unwrap();
    recorder
        .record(
            TrackPoint::sample(at(15))
                .with_location(47.3769, 8.5417)
                .with_altitude(408.0),
        )
        .unwrap();

    recorder.add_marker("Viewpoint", Some("scenery")).unwrap();

    let markers = db.get_markers(recorder.track_id()).unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].name, "Viewpoint");
    assert_eq!(markers[0].category.as_deref(), Some("scenery"));
    assert_eq!(markers[0].time, at(15));
    assert_relative_eq!(markers[0].latitude.unwrap(), 47.3769, epsilon = 1e-6);
    assert_relative_eq!(markers[0].longitude.unwrap(), 8.5417, epsilon = 1e-6);
}

#[test]
fn test_failed_summary_write_keeps_sensor_baseline() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tracks.db");
    let db = Database::new(&path).unwrap();
    let mut recorder =
        TrackRecorder::start(&db, &Track::new("Trainer"), StatisticsSettings::default(), at(0))
            .unwrap();
    recorder
        .record(TrackPoint::sample(at(10)).with_speed(4.0).with_sensor_distance(1000.0))
        .unwrap();

    // another connection makes every summary update fail
    let other = Connection::open(&path).unwrap();
    other
        .execute_batch(
            "CREATE TRIGGER reject_summary BEFORE UPDATE ON tracks \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

    let err = recorder
        .record(TrackPoint::sample(at(20)).with_speed(4.0).with_sensor_distance(1040.0))
        .unwrap_err();
    assert!(matches!(err, TrackStatsError::Database(_)));
    // the point was stored and aggregated, only the summary is behind
    assert_relative_eq!(recorder.statistics().total_distance(), 40.0);
    assert_relative_eq!(recorder.persisted_statistics().total_distance(), 0.0);

    other.execute_batch("DROP TRIGGER reject_summary;").unwrap();

    recorder
        .record(TrackPoint::sample(at(30)).with_speed(4.0).with_sensor_distance(1085.0))
        .unwrap();

    assert_relative_eq!(recorder.statistics().total_distance(), 85.0);
    assert_eq!(recorder.persisted_statistics(), &recorder.statistics());
    let stored = db.get_track(recorder.track_id()).unwrap();
    assert_relative_eq!(stored.statistics.total_distance(), 85.0);
    let replayed = replay_track(&db, recorder.track_id(), StatisticsSettings::default(), 10).unwrap();
    assert_eq!(replayed, recorder.statistics());
}

#[test]
fn test_opening_marker_keeps_its_readings() {
    let db = Database::open_in_memory().unwrap();
    let mut marker = TrackPoint::new(TrackPointType::SegmentStartAutomatic, at(0))
        .with_location(46.95, 7.44)
        .with_speed(3.0)
        .with_sensor_distance(500.0);
    marker.heart_rate = Some(98.0);

    let mut recorder =
        TrackRecorder::start_with_marker(&db, &Track::new("Commute"), StatisticsSettings::default(), marker)
            .unwrap();
    recorder
        .record(TrackPoint::sample(at(10)).with_speed(3.0).with_sensor_distance(530.0))
        .unwrap();

    let stored: Vec<TrackPoint> = PagedPointIterator::ascending(&db, recorder.track_id())
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(stored[0].point_type, TrackPointType::SegmentStartAutomatic);
    assert_relative_eq!(stored[0].latitude.unwrap(), 46.95, epsilon = 1e-6);
    assert_eq!(stored[0].heart_rate, Some(98.0));
    assert_eq!(stored[0].sensor_distance, Some(0.0));
    // the marker is the baseline for the cumulative odometer
    assert_relative_eq!(recorder.statistics().total_distance(), 30.0);
    assert_eq!(recorder.statistics().moving_time(), Duration::from_secs(10));
}

#[test]
fn test_opening_with_a_sample_is_rejected() {
    let db = Database::open_in_memory().unwrap();
    let result = TrackRecorder::start_with_marker(
        &db,
        &Track::new("Bad"),
        StatisticsSettings::default(),
        TrackPoint::sample(at(0)),
    );
    assert!(matches!(result, Err(TrackStatsError::Internal(_))));
}

#[test]
fn test_sub_millisecond_times_match_replay() {
    let db = Database::open_in_memory().unwrap();
    let settings = StatisticsSettings::default();
    let nanos = |secs: i64, ns: i64| at(secs) + chrono::Duration::nanoseconds(ns);

    let mut recorder = TrackRecorder::start(&db, &Track::new("Precise"), settings, nanos(0, 400_000)).unwrap();
    for (secs, ns) in [(1, 900_123), (2, 250_999), (3, 999_999)] {
        recorder
            .record(
                TrackPoint::sample(nanos(secs, ns))
                    .with_speed(3.0)
                    .with_heart_rate(120.0 + secs as f64),
            )
            .unwrap();
    }
    let live = recorder.finish(nanos(4, 700_500)).unwrap();

    let replayed = replay_track(&db, recorder.track_id(), settings, 2).unwrap();
    assert_eq!(replayed, live);
    assert_eq!(live.start_time(), Some(at(0)));
    assert_eq!(live.total_time(), Duration::from_millis(4_000));
}
