//! Error types for the barpath_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for barpath_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Workout plan failed validation
    #[error("Plan validation error: {0}")]
    PlanValidation(String),

    /// Referenced workout does not exist in the plan library
    #[error("Unknown workout: {0}")]
    UnknownWorkout(String),

    /// Referenced equipment does not exist in the plan library
    #[error("Unknown equipment: {0}")]
    UnknownEquipment(String),

    /// A session invariant was violated (e.g. a rest set reached a work state)
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Checkpoint could not be written or read
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for building a consistency violation
    pub fn consistency(msg: impl Into<String>) -> Self {
        Error::Consistency(msg.into())
    }

    pub fn is_consistency(&self) -> bool {
        matches!(self, Error::Consistency(_))
    }
}
