use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::extremity::ExtremityMonitor;
use crate::models::{
    Marker, MarkerId, SensorStatistics, Track, TrackId, TrackPoint, TrackPointId, TrackPointType,
};
use crate::statistics::{TrackStatistics, WeightedAverage};

/// Order in which a track's points are scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Oldest first (ascending ids)
    Ascending,
    /// Newest first (descending ids)
    Descending,
}

/// Read access to the persisted points of a track
pub trait PointStore {
    /// Returns at most `max_rows` points of `track_id` ordered by id in
    /// `direction`, starting at `start` inclusive (or at the first/last point)
    fn query_track_points(
        &self,
        track_id: TrackId,
        start: Option<TrackPointId>,
        max_rows: usize,
        direction: ScanDirection,
    ) -> Result<Vec<TrackPoint>, DatabaseError>;
}

/// Rows removed by [`Database::delete_track`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteSummary {
    pub track_points: usize,
    pub markers: usize,
}

/// Coordinates are stored as integer micro-degrees
const COORDINATE_SCALE: f64 = 1e6;

const POINT_COLUMNS: &str = "_id, type, time, latitude, longitude, accuracy, altitude, bearing, speed, \
     sensor_heartrate, sensor_cadence, sensor_power, sensor_distance, altitude_gain, altitude_loss";

const TRACK_COLUMNS: &str = "_id, uuid, name, description, activity_type, \
     start_time, stop_time, total_distance, total_time, moving_time, max_speed, \
     min_altitude, max_altitude, altitude_gain, altitude_loss, \
     avg_heartrate, avg_heartrate_weight, avg_cadence, avg_cadence_weight, \
     avg_power, avg_power_weight, is_idle";

/// SQLite-backed track store
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Create or open a database at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, DatabaseError> {
        let conn = Connection::open(&db_path)?;
        let mut db = Self { conn };
        db.init_schema()?;
        info!(path = %db_path.as_ref().display(), "Opened track database");
        Ok(db)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let mut db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&mut self) -> Result<(), DatabaseError> {
        // WAL lets readers keep a consistent snapshot while a writer commits
        let mode: String =
            self.conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "Journal mode set");
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", true)?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tracks (
                _id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                description TEXT,
                activity_type TEXT,

                -- Summary statistics
                start_time INTEGER,
                stop_time INTEGER,
                total_distance REAL NOT NULL DEFAULT 0,
                total_time INTEGER NOT NULL DEFAULT 0,
                moving_time INTEGER NOT NULL DEFAULT 0,
                max_speed REAL NOT NULL DEFAULT 0,
                min_altitude REAL,
                max_altitude REAL,
                altitude_gain REAL,
                altitude_loss REAL,
                avg_heartrate REAL,
                avg_heartrate_weight INTEGER,
                avg_cadence REAL,
                avg_cadence_weight INTEGER,
                avg_power REAL,
                avg_power_weight INTEGER,
                is_idle BOOLEAN NOT NULL DEFAULT FALSE
            );

            CREATE TABLE IF NOT EXISTS trackpoints (
                _id INTEGER PRIMARY KEY AUTOINCREMENT,
                trackid INTEGER NOT NULL,
                type INTEGER NOT NULL,
                time INTEGER NOT NULL,
                latitude INTEGER,
                longitude INTEGER,
                accuracy REAL,
                altitude REAL,
                bearing REAL,
                speed REAL,
                sensor_heartrate REAL,
                sensor_cadence REAL,
                sensor_power REAL,
                sensor_distance REAL,
                altitude_gain REAL,
                altitude_loss REAL,

                FOREIGN KEY (trackid) REFERENCES tracks (_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS markers (
                _id INTEGER PRIMARY KEY AUTOINCREMENT,
                trackid INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                category TEXT,
                time INTEGER NOT NULL,
                latitude INTEGER,
                longitude INTEGER,
                altitude REAL,

                FOREIGN KEY (trackid) REFERENCES tracks (_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS trackpoints_trackid_index ON trackpoints (trackid);
            CREATE INDEX IF NOT EXISTS markers_trackid_index ON markers (trackid);
            "#,
        )?;

        Ok(())
    }

    /// Insert a track with its current statistics, returning the new id
    pub fn insert_track(&self, track: &Track) -> Result<TrackId, DatabaseError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO tracks (uuid, name, description, activity_type) VALUES (?1, ?2, ?3, ?4)",
            params![track.uuid, track.name, track.description, track.activity_type],
        )?;
        let track_id = TrackId(tx.last_insert_rowid());
        write_statistics(&tx, track_id, &track.statistics)?;
        tx.commit()?;

        info!(track_id = %track_id, name = %track.name, "Inserted track");
        Ok(track_id)
    }

    /// Replace the persisted statistics summary of a track
    pub fn update_track_statistics(
        &self,
        track_id: TrackId,
        statistics: &TrackStatistics,
    ) -> Result<(), DatabaseError> {
        write_statistics(&self.conn, track_id, statistics)
    }

    pub fn get_track(&self, track_id: TrackId) -> Result<Track, DatabaseError> {
        get_track(&self.conn, track_id)
    }

    /// All tracks, most recently started first
    pub fn list_tracks(&self) -> Result<Vec<Track>, DatabaseError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM tracks ORDER BY start_time DESC, _id DESC",
            TRACK_COLUMNS
        ))?;
        let tracks = stmt
            .query_map([], track_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    /// Delete a track with all of its points and markers in one transaction
    pub fn delete_track(&mut self, track_id: TrackId) -> Result<DeleteSummary, DatabaseError> {
        let tx = self.conn.transaction()?;

        let track_points = tx.execute("DELETE FROM trackpoints WHERE trackid = ?1", params![track_id.0])?;
        let markers = tx.execute("DELETE FROM markers WHERE trackid = ?1", params![track_id.0])?;
        let tracks = tx.execute("DELETE FROM tracks WHERE _id = ?1", params![track_id.0])?;

        if tracks == 0 {
            // dropping the transaction rolls it back
            return Err(DatabaseError::track_not_found(track_id));
        }

        tx.commit()?;

        info!(track_id = %track_id, track_points, markers, "Deleted track");
        Ok(DeleteSummary {
            track_points,
            markers,
        })
    }

    /// Append one point to a track
    pub fn insert_track_point(
        &self,
        track_id: TrackId,
        point: &TrackPoint,
    ) -> Result<TrackPointId, DatabaseError> {
        insert_point(&self.conn, track_id, point)
    }

    /// Append points to a track in a single transaction; all or nothing
    pub fn insert_track_points(
        &mut self,
        track_id: TrackId,
        points: &[TrackPoint],
    ) -> Result<usize, DatabaseError> {
        let tx = self.conn.transaction()?;
        for point in points {
            insert_point(&tx, track_id, point)?;
        }
        tx.commit()?;

        debug!(track_id = %track_id, count = points.len(), "Bulk inserted track points");
        Ok(points.len())
    }

    pub fn last_track_point_id(&self, track_id: TrackId) -> Result<Option<TrackPointId>, DatabaseError> {
        last_track_point_id(&self.conn, track_id)
    }

    pub fn count_track_points(&self, track_id: TrackId) -> Result<usize, DatabaseError> {
        count_track_points(&self.conn, track_id)
    }

    /// Time-weighted sensor averages and maxima over a whole track
    pub fn get_sensor_stats(&self, track_id: TrackId) -> Result<SensorStatistics, DatabaseError> {
        sensor_stats(&self.conn, track_id)
    }

    pub fn insert_marker(&self, marker: &Marker) -> Result<MarkerId, DatabaseError> {
        self.conn.execute(
            r#"
            INSERT INTO markers (trackid, name, description, category, time, latitude, longitude, altitude)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                marker.track_id.0,
                marker.name,
                marker.description,
                marker.category,
                marker.time.timestamp_millis(),
                marker.latitude.map(to_micro_degrees),
                marker.longitude.map(to_micro_degrees),
                marker.altitude,
            ],
        )?;
        Ok(MarkerId(self.conn.last_insert_rowid()))
    }

    /// Markers of a track in time order
    pub fn get_markers(&self, track_id: TrackId) -> Result<Vec<Marker>, DatabaseError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT _id, trackid, name, description, category, time, latitude, longitude, altitude
            FROM markers WHERE trackid = ?1 ORDER BY time, _id
            "#,
        )?;
        let markers = stmt
            .query_map(params![track_id.0], |row| {
                Ok(Marker {
                    id: Some(MarkerId(row.get(0)?)),
                    track_id: TrackId(row.get(1)?),
                    name: row.get(2)?,
                    description: row.get(3)?,
                    category: row.get(4)?,
                    time: time_from_millis(row.get(5)?, 5)?,
                    latitude: row.get::<_, Option<i64>>(6)?.map(from_micro_degrees),
                    longitude: row.get::<_, Option<i64>>(7)?.map(from_micro_degrees),
                    altitude: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(markers)
    }

    /// Start a read transaction; queries through the snapshot see one
    /// consistent state even while other connections commit
    pub fn begin_read(&mut self) -> Result<ReadSnapshot<'_>, DatabaseError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)?;
        Ok(ReadSnapshot { tx })
    }
}

impl PointStore for Database {
    fn query_track_points(
        &self,
        track_id: TrackId,
        start: Option<TrackPointId>,
        max_rows: usize,
        direction: ScanDirection,
    ) -> Result<Vec<TrackPoint>, DatabaseError> {
        query_points(&self.conn, track_id, start, max_rows, direction)
    }
}

/// Consistent read view over the store
pub struct ReadSnapshot<'conn> {
    tx: Transaction<'conn>,
}

impl ReadSnapshot<'_> {
    pub fn get_track(&self, track_id: TrackId) -> Result<Track, DatabaseError> {
        get_track(&self.tx, track_id)
    }

    pub fn count_track_points(&self, track_id: TrackId) -> Result<usize, DatabaseError> {
        count_track_points(&self.tx, track_id)
    }

    pub fn last_track_point_id(&self, track_id: TrackId) -> Result<Option<TrackPointId>, DatabaseError> {
        last_track_point_id(&self.tx, track_id)
    }

    pub fn get_sensor_stats(&self, track_id: TrackId) -> Result<SensorStatistics, DatabaseError> {
        sensor_stats(&self.tx, track_id)
    }

    /// End the snapshot
    pub fn finish(self) -> Result<(), DatabaseError> {
        self.tx.commit()?;
        Ok(())
    }
}

impl PointStore for ReadSnapshot<'_> {
    fn query_track_points(
        &self,
        track_id: TrackId,
        start: Option<TrackPointId>,
        max_rows: usize,
        direction: ScanDirection,
    ) -> Result<Vec<TrackPoint>, DatabaseError> {
        query_points(&self.tx, track_id, start, max_rows, direction)
    }
}

fn query_points(
    conn: &Connection,
    track_id: TrackId,
    start: Option<TrackPointId>,
    max_rows: usize,
    direction: ScanDirection,
) -> Result<Vec<TrackPoint>, DatabaseError> {
    let (comparison, order, default_start) = match direction {
        ScanDirection::Ascending => (">=", "ASC", i64::MIN),
        ScanDirection::Descending => ("<=", "DESC", i64::MAX),
    };
    let sql = format!(
        "SELECT {} FROM trackpoints WHERE trackid = ?1 AND _id {} ?2 ORDER BY _id {} LIMIT ?3",
        POINT_COLUMNS, comparison, order
    );

    let mut stmt = conn.prepare_cached(&sql)?;
    let limit = i64::try_from(max_rows).unwrap_or(i64::MAX);
    let points = stmt
        .query_map(
            params![track_id.0, start.map_or(default_start, |id| id.0), limit],
            point_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(points)
}

fn insert_point(conn: &Connection, track_id: TrackId, point: &TrackPoint) -> Result<TrackPointId, DatabaseError> {
    let mut stmt = conn.prepare_cached(
        r#"
        INSERT INTO trackpoints (
            trackid, type, time, latitude, longitude, accuracy, altitude, bearing, speed,
            sensor_heartrate, sensor_cadence, sensor_power, sensor_distance, altitude_gain, altitude_loss
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
    )?;
    stmt.execute(params![
        track_id.0,
        point.point_type.to_db(),
        point.time.timestamp_millis(),
        point.latitude.map(to_micro_degrees),
        point.longitude.map(to_micro_degrees),
        point.horizontal_accuracy,
        point.altitude,
        point.bearing,
        point.speed,
        point.heart_rate,
        point.cadence,
        point.power,
        point.sensor_distance,
        point.altitude_gain,
        point.altitude_loss,
    ])?;
    Ok(TrackPointId(conn.last_insert_rowid()))
}

fn point_from_row(row: &Row) -> rusqlite::Result<TrackPoint> {
    let code: i64 = row.get(1)?;
    let point_type = TrackPointType::from_db(code).ok_or_else(|| {
        invalid_column(1, Type::Integer, "type", format!("unknown track point type {}", code))
    })?;

    Ok(TrackPoint {
        id: Some(TrackPointId(row.get(0)?)),
        point_type,
        time: time_from_millis(row.get(2)?, 2)?,
        latitude: row.get::<_, Option<i64>>(3)?.map(from_micro_degrees),
        longitude: row.get::<_, Option<i64>>(4)?.map(from_micro_degrees),
        horizontal_accuracy: row.get(5)?,
        altitude: row.get(6)?,
        bearing: row.get(7)?,
        speed: row.get(8)?,
        heart_rate: row.get(9)?,
        cadence: row.get(10)?,
        power: row.get(11)?,
        sensor_distance: row.get(12)?,
        altitude_gain: row.get(13)?,
        altitude_loss: row.get(14)?,
    })
}

fn write_statistics(
    conn: &Connection,
    track_id: TrackId,
    stats: &TrackStatistics,
) -> Result<(), DatabaseError> {
    let weight = |avg: Option<WeightedAverage>| avg.map(|a| duration_millis(a.weight));
    let updated = conn.execute(
        r#"
        UPDATE tracks SET
            start_time = ?2, stop_time = ?3, total_distance = ?4, total_time = ?5,
            moving_time = ?6, max_speed = ?7, min_altitude = ?8, max_altitude = ?9,
            altitude_gain = ?10, altitude_loss = ?11,
            avg_heartrate = ?12, avg_heartrate_weight = ?13,
            avg_cadence = ?14, avg_cadence_weight = ?15,
            avg_power = ?16, avg_power_weight = ?17, is_idle = ?18
        WHERE _id = ?1
        "#,
        params![
            track_id.0,
            stats.start_time.map(|t| t.timestamp_millis()),
            stats.stop_time.map(|t| t.timestamp_millis()),
            stats.total_distance,
            duration_millis(stats.total_time),
            duration_millis(stats.moving_time),
            stats.max_speed,
            stats.altitude_extremities.min_opt(),
            stats.altitude_extremities.max_opt(),
            stats.total_altitude_gain,
            stats.total_altitude_loss,
            stats.avg_heart_rate.map(|a| a.average),
            weight(stats.avg_heart_rate),
            stats.avg_cadence.map(|a| a.average),
            weight(stats.avg_cadence),
            stats.avg_power.map(|a| a.average),
            weight(stats.avg_power),
            stats.is_idle,
        ],
    )?;

    if updated == 0 {
        return Err(DatabaseError::track_not_found(track_id));
    }
    Ok(())
}

fn get_track(conn: &Connection, track_id: TrackId) -> Result<Track, DatabaseError> {
    conn.query_row(
        &format!("SELECT {} FROM tracks WHERE _id = ?1", TRACK_COLUMNS),
        params![track_id.0],
        track_from_row,
    )
    .optional()?
    .ok_or_else(|| DatabaseError::track_not_found(track_id))
}

fn track_from_row(row: &Row) -> rusqlite::Result<Track> {
    let mut altitude_extremities = ExtremityMonitor::new();
    if let (Some(min), Some(max)) = (row.get::<_, Option<f64>>(11)?, row.get::<_, Option<f64>>(12)?) {
        altitude_extremities.set(min, max);
    }

    let average = |value: usize| -> rusqlite::Result<Option<WeightedAverage>> {
        let avg: Option<f64> = row.get(value)?;
        let weight: Option<i64> = row.get(value + 1)?;
        Ok(avg.map(|avg| WeightedAverage::new(avg, millis_duration(weight.unwrap_or(0)))))
    };

    let statistics = TrackStatistics {
        start_time: row
            .get::<_, Option<i64>>(5)?
            .map(|ms| time_from_millis(ms, 5))
            .transpose()?,
        stop_time: row
            .get::<_, Option<i64>>(6)?
            .map(|ms| time_from_millis(ms, 6))
            .transpose()?,
        total_distance: row.get(7)?,
        total_time: millis_duration(row.get(8)?),
        moving_time: millis_duration(row.get(9)?),
        max_speed: row.get(10)?,
        altitude_extremities,
        total_altitude_gain: row.get(13)?,
        total_altitude_loss: row.get(14)?,
        avg_heart_rate: average(15)?,
        avg_cadence: average(17)?,
        avg_power: average(19)?,
        is_idle: row.get(21)?,
    };

    Ok(Track {
        id: Some(TrackId(row.get(0)?)),
        uuid: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        activity_type: row.get(4)?,
        statistics,
    })
}

fn last_track_point_id(conn: &Connection, track_id: TrackId) -> Result<Option<TrackPointId>, DatabaseError> {
    let id: Option<i64> = conn.query_row(
        "SELECT MAX(_id) FROM trackpoints WHERE trackid = ?1",
        params![track_id.0],
        |row| row.get(0),
    )?;
    Ok(id.map(TrackPointId))
}

fn count_track_points(conn: &Connection, track_id: TrackId) -> Result<usize, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM trackpoints WHERE trackid = ?1",
        params![track_id.0],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Each row is weighted by the time until the next row. A row followed by a
/// manual segment start covers a pause and gets no weight; manual start rows
/// carry no readings of their own and are left out. A channel whose readings
/// cover no time reports neither average nor maximum.
fn sensor_stats(conn: &Connection, track_id: TrackId) -> Result<SensorStatistics, DatabaseError> {
    let manual_start = TrackPointType::SegmentStartManual.to_db();
    let stats = conn.query_row(
        r#"
        WITH spans AS (
            SELECT
                type,
                sensor_heartrate,
                sensor_cadence,
                sensor_power,
                CASE
                    WHEN next_type IS NULL OR next_type = ?2 THEN 0
                    ELSE MAX(next_time - time, 0)
                END AS span
            FROM (
                SELECT
                    type, time, sensor_heartrate, sensor_cadence, sensor_power,
                    LEAD(time) OVER (ORDER BY _id) AS next_time,
                    LEAD(type) OVER (ORDER BY _id) AS next_type
                FROM trackpoints
                WHERE trackid = ?1
            )
        )
        SELECT
            CASE WHEN heartrate_span > 0 THEN max_heartrate END,
            heartrate_sum / NULLIF(heartrate_span, 0),
            CASE WHEN cadence_span > 0 THEN max_cadence END,
            cadence_sum / NULLIF(cadence_span, 0),
            CASE WHEN power_span > 0 THEN max_power END,
            power_sum / NULLIF(power_span, 0)
        FROM (
            SELECT
                MAX(sensor_heartrate) AS max_heartrate,
                SUM(sensor_heartrate * span) AS heartrate_sum,
                SUM(CASE WHEN sensor_heartrate IS NOT NULL THEN span END) AS heartrate_span,
                MAX(sensor_cadence) AS max_cadence,
                SUM(sensor_cadence * span) AS cadence_sum,
                SUM(CASE WHEN sensor_cadence IS NOT NULL THEN span END) AS cadence_span,
                MAX(sensor_power) AS max_power,
                SUM(sensor_power * span) AS power_sum,
                SUM(CASE WHEN sensor_power IS NOT NULL THEN span END) AS power_span
            FROM spans
            WHERE type != ?2
        )
        "#,
        params![track_id.0, manual_start],
        |row| {
            Ok(SensorStatistics {
                max_heart_rate: row.get(0)?,
                avg_heart_rate: row.get(1)?,
                max_cadence: row.get(2)?,
                avg_cadence: row.get(3)?,
                max_power: row.get(4)?,
                avg_power: row.get(5)?,
            })
        },
    )?;
    Ok(stats)
}

fn to_micro_degrees(degrees: f64) -> i64 {
    (degrees * COORDINATE_SCALE).round() as i64
}

fn from_micro_degrees(value: i64) -> f64 {
    value as f64 / COORDINATE_SCALE
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn millis_duration(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}

fn time_from_millis(millis: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        invalid_column(column, Type::Integer, "time", format!("timestamp {} out of range", millis))
    })
}

fn invalid_column(index: usize, kind: Type, column: &str, reason: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(DatabaseError::InvalidData {
            column: column.to_string(),
            reason,
        }),
    )
}
