//! Error taxonomy for the attendance engine
//!
//! - `PositionError` - positioning subsystem failures (permission, timeouts)
//! - `StoreError` - record store failures, split into retryable and permanent
//! - `GeofenceConfigError` - stops that cannot produce a geofence
//! - `CommandError` - rejected manual driver commands

use crate::domain::types::{StopId, StudentId};
use thiserror::Error;

/// Errors from the positioning subsystem
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PositionError {
    #[error("Foreground positioning permission denied")]
    PermissionDenied,

    #[error("Position request timed out")]
    Timeout,

    #[error("Position unavailable: {0}")]
    Unavailable(String),

    /// The provider will never produce another fix (replay exhausted, device gone)
    #[error("Position source closed")]
    SourceClosed,
}

/// Errors from the backing record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    /// The store answered and refused the write; retrying will not help
    #[error("Rejected by store (status {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl StoreError {
    /// Whether a retry has any chance of succeeding
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Rejected { .. } | StoreError::Serialization(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Http(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stop that cannot be turned into a geofence
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeofenceConfigError {
    #[error("Stop {0} has no coordinates")]
    MissingCoordinates(StopId),

    #[error("Stop {stop_id} has out-of-range coordinates ({latitude}, {longitude})")]
    InvalidCoordinates { stop_id: StopId, latitude: f64, longitude: f64 },

    #[error("Stop {stop_id} has invalid radius {radius}")]
    InvalidRadius { stop_id: StopId, radius: f64 },
}

/// A manual driver command that could not be applied
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("Student {0} is not on this route")]
    UnknownStudent(StudentId),

    #[error("Student {0} is not at the current stop")]
    NotCurrent(StudentId),

    #[error("Attendance for student {0} is already final")]
    AlreadyFinal(StudentId),

    #[error("No student left in the queue")]
    QueueEmpty,

    #[error("Route execution has ended")]
    RouteEnded,
}
