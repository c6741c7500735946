// Library interface for capacityrs
// Forecasting of personal energy and social capacity, plus schedule
// conflict detection and capacity-aware rescheduling.

pub mod accuracy;
pub mod clock;
pub mod config;
pub mod conflicts;
pub mod engine;
pub mod error;
pub mod forecast;
pub mod import;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod optimizer;
pub mod resource_state;
pub mod stats;

// Re-export commonly used types for convenience
pub use models::*;
pub use accuracy::{AccuracyConfig, AccuracyRecord, AccuracyTracker, OutcomeReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use conflicts::{Conflict, ConflictConfig, ConflictDetector, ConflictKind, Severity};
pub use engine::{CapacityEngine, ScheduleLocks};
pub use error::{EngineError, ErrorSeverity, Result};
pub use forecast::{Forecast, ForecastConfig, ForecastInsights, Forecaster, LearnedModel, PredictionPoint};
pub use jobs::{JobConfig, JobKind, JobRunSummary, JobScheduler};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use optimizer::{
    OptimizationMetrics, OptimizationResult, OptimizationStatus, OptimizerConfig, ScheduleOptimizer,
    UnscheduledReason,
};
pub use resource_state::{ResourceState, ResourceTracker, SampleRecord, StateChange};
