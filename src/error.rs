//! Unified error handling for route sync.
//!
//! `SyncError` is what a refresh can fail with; it always maps to a short
//! user-facing message. `StoreError` stays inside the cache layer: the route
//! cache is best-effort and absorbs it.

use thiserror::Error;

/// Failure of a sync operation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The workout data source cannot be used on this device.
    #[error("workout source unavailable")]
    SourceUnavailable,

    /// The user declined or revoked access to workout data.
    #[error("authorization denied")]
    AuthorizationDenied,

    /// Any other failure while fetching records or samples.
    #[error("fetch failed: {message}")]
    TransientFetchFailure { message: String },

    /// An access or fetch call exceeded the configured operation timeout.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// Explicit store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Wrap any displayable error as a transient fetch failure.
    pub fn transient(message: impl Into<String>) -> Self {
        SyncError::TransientFetchFailure {
            message: message.into(),
        }
    }

    /// Short, human-readable message for the error state shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::SourceUnavailable => {
                "Workout data isn't available on this device.".to_string()
            }
            SyncError::AuthorizationDenied => {
                "Access to workouts was denied. Allow access in Settings to load routes."
                    .to_string()
            }
            SyncError::TransientFetchFailure { message } => {
                format!("Couldn't load workouts: {}", message)
            }
            SyncError::Timeout { .. } => "Loading workouts timed out.".to_string(),
            SyncError::Store(_) => "Couldn't read saved routes.".to_string(),
        }
    }

    /// Whether the failure aborts a refresh even mid-way through the record loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::SourceUnavailable | SyncError::AuthorizationDenied
        )
    }
}

/// Failure inside a durable store or while encoding the cached document.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "persistence")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid store key '{0}'")]
    InvalidKey(String),
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
