//! Unified error hierarchy for capacityrs
//!
//! Only boundary-contract violations surface as errors. Internal strategy
//! failures are contained by the ensemble and degraded results are preferred
//! over failures everywhere else.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ResourceKind;

/// Top-level error type for all engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected sample at the ingestion boundary
    #[error("Sample error: {0}")]
    Sample(#[from] SampleError),

    /// Forecast request errors
    #[error("Forecast error: {0}")]
    Forecast(#[from] ForecastError),

    /// Malformed schedule input
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Accuracy feedback errors
    #[error("Accuracy error: {0}")]
    Accuracy(#[from] AccuracyError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Sample ingestion errors
#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    /// Level was NaN
    #[error("Level for {kind} is not a number")]
    NonFiniteLevel { kind: ResourceKind },

    /// Backfilled sample precedes the latest recorded sample
    #[error("Sample for {kind} at {timestamp} precedes latest sample at {latest}")]
    OutOfOrder {
        kind: ResourceKind,
        timestamp: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
}

/// Forecast errors
#[derive(Debug, Error, PartialEq)]
pub enum ForecastError {
    /// No samples exist for the requested resource
    #[error("Insufficient history for {kind}: {samples} samples")]
    InsufficientHistory { kind: ResourceKind, samples: usize },

    /// Horizon outside the supported range
    #[error("Invalid horizon: {hours} hours (supported 1..={max})")]
    InvalidHorizon { hours: u32, max: u32 },
}

/// Schedule input errors
#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    /// Malformed duration, time, or requirement
    #[error("Invalid schedule item '{id}': {reason}")]
    InvalidScheduleItem { id: String, reason: String },

    /// Two items share one id
    #[error("Duplicate schedule item id: {id}")]
    DuplicateId { id: String },
}

/// Accuracy tracking errors
#[derive(Debug, Error, PartialEq)]
pub enum AccuracyError {
    /// Forecast was never registered with the tracker
    #[error("Unknown forecast: {0}")]
    UnknownForecast(Uuid),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EngineError::Sample(_) => ErrorSeverity::Warning,
            EngineError::Forecast(ForecastError::InsufficientHistory { .. }) => {
                ErrorSeverity::Info
            }
            EngineError::Forecast(_) => ErrorSeverity::Warning,
            EngineError::Schedule(_) => ErrorSeverity::Warning,
            EngineError::Accuracy(_) => ErrorSeverity::Warning,
            EngineError::Configuration(_) => ErrorSeverity::Error,
            EngineError::Internal(_) => ErrorSeverity::Critical,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Forecast(ForecastError::InsufficientHistory { kind, .. }) => {
                format!(
                    "Not enough {} history yet. Log a few check-ins to enable forecasting.",
                    kind
                )
            }
            EngineError::Schedule(ScheduleError::InvalidScheduleItem { id, reason }) => {
                format!("Calendar item '{}' could not be read: {}", id, reason)
            }
            EngineError::Sample(SampleError::OutOfOrder { kind, .. }) => {
                format!("A newer {} check-in already exists.", kind)
            }
            _ => self.to_string(),
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
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}
