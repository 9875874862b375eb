//! Central error handling for the elevation engine
//!
//! Provides a unified ElevationError enum. Every failure kind degrades to
//! "no data for this key" at the layer boundary except cancellation and
//! unsupported writes, which callers need to tell apart.

use std::sync::Arc;

/// Centralized error type for all elevation operations
#[derive(thiserror::Error, Debug, Clone)]
pub enum ElevationError {
    #[error("No profile: {0}")]
    NoProfile(String),

    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Invalid tile key: {0}")]
    InvalidKey(String),

    #[error("Invalid extent: {0}")]
    InvalidExtent(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl ElevationError {
    /// Convenience constructors for common error types
    pub fn invalid_grid<T: ToString>(msg: T) -> Self {
        ElevationError::InvalidGrid(msg.to_string())
    }

    pub fn unavailable<T: ToString>(msg: T) -> Self {
        ElevationError::SourceUnavailable(msg.to_string())
    }

    pub fn config<T: ToString>(msg: T) -> Self {
        ElevationError::Config(msg.to_string())
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ElevationError::Canceled)
    }
}

impl From<std::io::Error> for ElevationError {
    fn from(err: std::io::Error) -> Self {
        ElevationError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for ElevationError {
    fn from(err: serde_json::Error) -> Self {
        ElevationError::Json(Arc::new(err))
    }
}

/// Result type alias for elevation operations
pub type ElevationResult<T> = Result<T, ElevationError>;
