//! Unified error hierarchy for trackstats
//!
//! Contract violations raised by the aggregator are kept apart from storage
//! failures so callers can tell a corrupted point stream from a busy disk.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{TrackId, TrackPointId};

/// Top-level error type for all trackstats operations
#[derive(Debug, Error)]
pub enum TrackStatsError {
    /// Point stream violated the aggregator's ordering contract
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Database operation errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Paged iteration errors
    #[error("Iteration error: {0}")]
    Iteration(#[from] PointIteratorError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Violations of the point-ordering contract.
///
/// These indicate a clock or ordering bug upstream and are never clamped away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    /// A point arrived with a timestamp before the previous one
    #[error("Non-monotonic time: {current} is before {previous}")]
    NonMonotonicTime {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    /// A time delta between two samples came out negative
    #[error("Negative duration from {from} to {to}")]
    NegativeDuration {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

/// Database operation errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Record not found
    #[error("Record not found: {table}.{id}")]
    NotFound { table: String, id: String },

    /// Stored value could not be mapped back into the model
    #[error("Invalid data in {column}: {reason}")]
    InvalidData { column: String, reason: String },
}

impl DatabaseError {
    pub fn track_not_found(track_id: TrackId) -> Self {
        DatabaseError::NotFound {
            table: "tracks".to_string(),
            id: track_id.to_string(),
        }
    }
}

/// Errors from [`crate::iterator::PagedPointIterator`]
#[derive(Debug, Error)]
pub enum PointIteratorError {
    /// `next_point` was called after the last row was returned
    #[error("No more track points after {last_id:?}")]
    Exhausted { last_id: Option<TrackPointId> },

    /// The iterator was closed before the call
    #[error("Iterator already closed")]
    Closed,

    /// The store failed while fetching a page
    #[error("Store error while paging: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias for trackstats operations
pub type Result<T> = std::result::Result<T, TrackStatsError>;

impl TrackStatsError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            TrackStatsError::Database(db) | TrackStatsError::Iteration(PointIteratorError::Store(db)) => {
                db.is_busy()
            }
            TrackStatsError::Io(_) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TrackStatsError::Aggregation(_) => ErrorSeverity::Critical,
            TrackStatsError::Database(DatabaseError::NotFound { .. }) => ErrorSeverity::Warning,
            TrackStatsError::Iteration(PointIteratorError::Exhausted { .. }) => ErrorSeverity::Warning,
            TrackStatsError::Configuration(_) => ErrorSeverity::Error,
            TrackStatsError::Internal(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            TrackStatsError::Aggregation(AggregationError::NonMonotonicTime { .. }) => {
                "Track points arrived out of order; statistics were not updated.".to_string()
            }
            TrackStatsError::Database(DatabaseError::NotFound { table, id }) => {
                format!("Could not find {} with id {}", table.trim_end_matches('s'), id)
            }
            TrackStatsError::Database(db) if db.is_busy() => {
                "The track database is busy. Please try again.".to_string()
            }
            _ => self.to_string(),
        }
    }
}

impl DatabaseError {
    /// SQLite reported a lock or busy condition
    pub fn is_busy(&self) -> bool {
        match self {
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
}
