//! Unified error handling for the place-tracker library.
//!
//! Expected outcomes are not errors here: a rejected fix is a
//! [`FilterDecision::Reject`](crate::filter::FilterDecision), a stale
//! enter/exit is an ignored [`TransitionOutcome`](crate::visits::TransitionOutcome),
//! and a force-closed visit carries the `reconciled` flag. This type covers the
//! failures a caller has to act on.

use std::fmt;

use crate::PlaceId;

/// Unified error type for place-tracker operations.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaceTrackerError {
    /// Clustering was requested with fewer fixes than a single cluster needs
    InsufficientData {
        fix_count: usize,
        minimum_required: usize,
    },
    /// Operation referenced a place that does not exist
    UnknownPlace { place_id: PlaceId },
    /// Persistence collaborator failed (I/O, SQL, serialization)
    PersistenceError { message: String },
    /// Configuration error
    ConfigError { message: String },
    /// Event queue is at capacity
    QueueFull,
    /// Event queue worker has shut down
    QueueClosed,
    /// Generic internal error
    Internal { message: String },
}

impl fmt::Display for PlaceTrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceTrackerError::InsufficientData {
                fix_count,
                minimum_required,
            } => {
                write!(
                    f,
                    "Not enough data yet: {} fixes, minimum {} required",
                    fix_count, minimum_required
                )
            }
            PlaceTrackerError::UnknownPlace { place_id } => {
                write!(f, "Unknown place {}", place_id)
            }
            PlaceTrackerError::PersistenceError { message } => {
                write!(f, "Persistence error: {}", message)
            }
            PlaceTrackerError::ConfigError { message } => {
                write!(f, "Configuration error: {}", message)
            }
            PlaceTrackerError::QueueFull => write!(f, "Event queue is full"),
            PlaceTrackerError::QueueClosed => write!(f, "Event queue is closed"),
            PlaceTrackerError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for PlaceTrackerError {}

impl PlaceTrackerError {
    /// Shorthand for a persistence failure.
    pub fn persistence(message: impl Into<String>) -> Self {
        PlaceTrackerError::PersistenceError {
            message: message.into(),
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        PlaceTrackerError::ConfigError {
            message: message.into(),
        }
    }

    /// Whether this error should be shown to the user as "not enough data yet"
    /// rather than as a technical failure.
    pub fn is_not_enough_data(&self) -> bool {
        matches!(self, PlaceTrackerError::InsufficientData { .. })
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for PlaceTrackerError {
    fn from(err: rusqlite::Error) -> Self {
        PlaceTrackerError::persistence(err.to_string())
    }
}

impl From<serde_json::Error> for PlaceTrackerError {
    fn from(err: serde_json::Error) -> Self {
        PlaceTrackerError::Internal {
            message: format!("JSON: {}", err),
        }
    }
}

/// Result type alias for place-tracker operations.
pub type Result<T> = std::result::Result<T, PlaceTrackerError>;

/// Extension trait for converting Option to PlaceTrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an unknown place error.
    fn ok_or_unknown_place(self, place_id: PlaceId) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_unknown_place(self, place_id: PlaceId) -> Result<T> {
        self.ok_or(PlaceTrackerError::UnknownPlace { place_id })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| PlaceTrackerError::Internal {
            message: message.to_string(),
        })
    }
}

/// Require at least `minimum` items, otherwise `InsufficientData`.
pub fn require_sufficient(fix_count: usize, minimum: usize) -> Result<()> {
    if fix_count < minimum {
        return Err(PlaceTrackerError::InsufficientData {
            fix_count,
            minimum_required: minimum,
        });
    }
    Ok(())
}
