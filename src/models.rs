use chrono::{DateTime, Utc};
use geo::{GeodesicDistance, Point};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::statistics::TrackStatistics;

/// Database identifier of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub i64);

/// Database identifier of a track point; ascending ids follow insertion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackPointId(pub i64);

/// Database identifier of a marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerId(pub i64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TrackPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a point within the recorded stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackPointType {
    /// Start of a segment due to user interaction (start, resume)
    SegmentStartManual,
    /// Start of a segment due to too much distance from the previous point
    SegmentStartAutomatic,
    /// Ordinary sample (GPS and/or sensor data)
    #[default]
    TrackPoint,
    /// Explicit end of a segment (pause, stop)
    SegmentEndManual,
    /// Device detected no motion
    Idle,
}

impl TrackPointType {
    /// Integer code used in the `trackpoints.type` column
    pub fn to_db(self) -> i64 {
        match self {
            TrackPointType::SegmentStartManual => -2,
            TrackPointType::SegmentStartAutomatic => -1,
            TrackPointType::TrackPoint => 0,
            TrackPointType::SegmentEndManual => 1,
            TrackPointType::Idle => 3,
        }
    }

    pub fn from_db(code: i64) -> Option<Self> {
        match code {
            -2 => Some(TrackPointType::SegmentStartManual),
            -1 => Some(TrackPointType::SegmentStartAutomatic),
            // 2 was a sensor-only sample in older databases
            0 | 2 => Some(TrackPointType::TrackPoint),
            1 => Some(TrackPointType::SegmentEndManual),
            3 => Some(TrackPointType::Idle),
            _ => None,
        }
    }

    pub fn is_segment_start(self) -> bool {
        matches!(
            self,
            TrackPointType::SegmentStartManual | TrackPointType::SegmentStartAutomatic
        )
    }
}

/// One observation of a recorded track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    /// Set once the point has been persisted
    pub id: Option<TrackPointId>,

    #[serde(default)]
    pub point_type: TrackPointType,

    /// Monotonic recording time
    pub time: DateTime<Utc>,

    /// Latitude in degrees (WGS84)
    pub latitude: Option<f64>,

    /// Longitude in degrees (WGS84)
    pub longitude: Option<f64>,

    /// Horizontal accuracy in meters
    pub horizontal_accuracy: Option<f64>,

    /// Altitude in meters
    pub altitude: Option<f64>,

    /// Bearing in degrees
    pub bearing: Option<f64>,

    /// Speed in meters per second
    pub speed: Option<f64>,

    /// Heart rate in beats per minute
    pub heart_rate: Option<f64>,

    /// Cadence in revolutions (or steps) per minute
    pub cadence: Option<f64>,

    /// Power in watts
    pub power: Option<f64>,

    /// Distance in meters reported by a speed/distance sensor since the previous point
    pub sensor_distance: Option<f64>,

    /// Barometric altitude gain in meters since the previous point
    pub altitude_gain: Option<f64>,

    /// Barometric altitude loss in meters since the previous point
    pub altitude_loss: Option<f64>,
}

impl TrackPoint {
    /// An empty point of the given type; position and sensor data are added with the builder methods
    pub fn new(point_type: TrackPointType, time: DateTime<Utc>) -> Self {
        Self {
            id: None,
            point_type,
            time,
            latitude: None,
            longitude: None,
            horizontal_accuracy: None,
            altitude: None,
            bearing: None,
            speed: None,
            heart_rate: None,
            cadence: None,
            power: None,
            sensor_distance: None,
            altitude_gain: None,
            altitude_loss: None,
        }
    }

    pub fn sample(time: DateTime<Utc>) -> Self {
        Self::new(TrackPointType::TrackPoint, time)
    }

    pub fn segment_start_manual(time: DateTime<Utc>) -> Self {
        Self::new(TrackPointType::SegmentStartManual, time)
    }

    pub fn segment_end_manual(time: DateTime<Utc>) -> Self {
        Self::new(TrackPointType::SegmentEndManual, time)
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_heart_rate(mut self, heart_rate: f64) -> Self {
        self.heart_rate = Some(heart_rate);
        self
    }

    pub fn with_cadence(mut self, cadence: f64) -> Self {
        self.cadence = Some(cadence);
        self
    }

    pub fn with_power(mut self, power: f64) -> Self {
        self.power = Some(power);
        self
    }

    pub fn with_sensor_distance(mut self, distance: f64) -> Self {
        self.sensor_distance = Some(distance);
        self
    }

    pub fn with_altitude_gain(mut self, gain: f64) -> Self {
        self.altitude_gain = Some(gain);
        self
    }

    pub fn with_altitude_loss(mut self, loss: f64) -> Self {
        self.altitude_loss = Some(loss);
        self
    }

    pub fn has_location(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    /// Moving means a reported speed at or above `threshold` (m/s); no speed is not moving
    pub fn is_moving(&self, threshold: f64) -> bool {
        self.speed.map_or(false, |speed| speed >= threshold)
    }

    /// Geodesic distance in meters to `previous`, `None` unless both points are located
    pub fn distance_to_previous_from_location(&self, previous: &TrackPoint) -> Option<f64> {
        match (self.latitude, self.longitude, previous.latitude, previous.longitude) {
            (Some(lat), Some(lon), Some(prev_lat), Some(prev_lon)) => {
                let here = Point::new(lon, lat);
                let there = Point::new(prev_lon, prev_lat);
                Some(here.geodesic_distance(&there))
            }
            _ => None,
        }
    }

    /// Turns cumulative sensor readings into deltas relative to `baseline`
    pub fn minus_cumulative_sensor_data(&mut self, baseline: &TrackPoint) {
        if let (Some(distance), Some(base)) = (self.sensor_distance, baseline.sensor_distance) {
            self.sensor_distance = Some(distance - base);
        }
        if let (Some(gain), Some(base)) = (self.altitude_gain, baseline.altitude_gain) {
            self.altitude_gain = Some(gain - base);
        }
        if let (Some(loss), Some(base)) = (self.altitude_loss, baseline.altitude_loss) {
            self.altitude_loss = Some(loss - base);
        }
    }
}

/// Recorded track with its persisted summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: Option<TrackId>,

    /// Stable identity across devices
    pub uuid: String,

    pub name: String,

    pub description: Option<String>,

    /// Free-form activity label, e.g. "running" or "mountain biking"
    pub activity_type: Option<String>,

    pub statistics: TrackStatistics,
}

impl Track {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            activity_type: None,
            statistics: TrackStatistics::default(),
        }
    }

    pub fn with_activity_type(mut self, activity_type: impl Into<String>) -> Self {
        self.activity_type = Some(activity_type.into());
        self
    }
}

/// User annotation attached to a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: Option<MarkerId>,
    pub track_id: TrackId,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub time: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
}

/// Aggregate sensor values over a whole track as computed by the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorStatistics {
    pub max_heart_rate: Option<f64>,
    pub avg_heart_rate: Option<f64>,
    pub max_cadence: Option<f64>,
    pub avg_cadence: Option<f64>,
    pub max_power: Option<f64>,
    pub avg_power: Option<f64>,
}

impl SensorStatistics {
    pub fn has_data(&self) -> bool {
        self.avg_heart_rate.is_some() || self.avg_cadence.is_some() || self.avg_power.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_type_codes_roundtrip() {
        for point_type in [
            TrackPointType::SegmentStartManual,
            TrackPointType::SegmentStartAutomatic,
            TrackPointType::TrackPoint,
            TrackPointType::SegmentEndManual,
            TrackPointType::Idle,
        ] {
            assert_eq!(TrackPointType::from_db(point_type.to_db()), Some(point_type));
        }
        assert_eq!(TrackPointType::from_db(2), Some(TrackPointType::TrackPoint));
        assert_eq!(TrackPointType::from_db(42), None);
    }

    #[test]
    fn test_is_moving_requires_speed() {
        let point = TrackPoint::sample(at(0));
        assert!(!point.is_moving(0.1));
        assert!(point.clone().with_speed(0.1).is_moving(0.1));
        assert!(!point.with_speed(0.05).is_moving(0.1));
    }

    #[test]
    fn test_geodesic_distance() {
        let a = TrackPoint::sample(at(0)).with_location(0.0, 0.0);
        let b = TrackPoint::sample(at(1_000)).with_location(0.001, 0.0);
        let distance = b.distance_to_previous_from_location(&a).unwrap();
        assert_relative_eq!(distance, 110.57, epsilon = 0.01);

        let unlocated = TrackPoint::sample(at(2_000));
        assert!(unlocated.distance_to_previous_from_location(&a).is_none());
    }

    #[test]
    fn test_minus_cumulative_sensor_data() {
        let baseline = TrackPoint::sample(at(0))
            .with_sensor_distance(100.0)
            .with_altitude_gain(3.0);
        let mut point = TrackPoint::sample(at(1_000))
            .with_sensor_distance(112.5)
            .with_altitude_gain(4.0)
            .with_altitude_loss(1.0);

        point.minus_cumulative_sensor_data(&baseline);

        assert_relative_eq!(point.sensor_distance.unwrap(), 12.5);
        assert_relative_eq!(point.altitude_gain.unwrap(), 1.0);
        // no baseline loss, value stays as reported
        assert_relative_eq!(point.altitude_loss.unwrap(), 1.0);
    }
}
