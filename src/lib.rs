// Library interface for trackstats modules
// Integration tests and the CLI binary use the core functionality through here

pub mod aggregator;
pub mod config;
pub mod database;
pub mod error;
pub mod extremity;
pub mod iterator;
pub mod logging;
pub mod models;
pub mod recording;
pub mod replay;
pub mod smoothing;
pub mod statistics;

// Re-export commonly used types for convenience
pub use aggregator::StatisticsAggregator;
pub use config::{AppConfig, StatisticsSettings, StoreSettings};
pub use database::{Database, DeleteSummary, PointStore, ReadSnapshot, ScanDirection};
pub use error::{AggregationError, DatabaseError, PointIteratorError, Result, TrackStatsError};
pub use extremity::ExtremityMonitor;
pub use iterator::{PagedPointIterator, DEFAULT_PAGE_SIZE};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use models::*;
pub use recording::{RecordingState, TrackRecorder};
pub use replay::{recompute_track_statistics, replay_track, TrackFollower};
pub use smoothing::{Smoothable, SmoothingBuffer};
pub use statistics::{TrackStatistics, WeightedAverage};
