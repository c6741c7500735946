//! Pluggable learned-model strategy
//!
//! The model itself is a black box supplied by the host application. Errors,
//! panics and non-finite outputs exclude it from the ensemble for that call.

use chrono::{DateTime, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

use super::strategy::{PredictionContext, PredictionStrategy, StrategyError, StrategyPrediction};
use crate::models::{ExternalFactors, ResourceKind};
use crate::stats::clamp_level;

pub const LEARNED_STRATEGY: &str = "learned";

/// Number of most recent levels handed to the model
const RECENT_WINDOW: usize = 24;

/// Features handed to a learned model
#[derive(Debug, Clone)]
pub struct LearnedModelInput {
    pub kind: ResourceKind,
    pub target_time: DateTime<Utc>,
    pub hour_offset: u32,
    pub hour_of_day: u32,
    pub day_of_week: u32,
    /// Most recent levels, oldest first
    pub recent_levels: Vec<f64>,
    pub factors: ExternalFactors,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LearnedModelError {
    #[error("model not loaded")]
    NotLoaded,

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Contract of an externally trained model: `(level, confidence)`
pub trait LearnedModel: Send + Sync {
    fn predict(&self, input: &LearnedModelInput) -> Result<(f64, f64), LearnedModelError>;
}

/// Adapts a [`LearnedModel`] to the strategy interface
pub struct LearnedStrategy {
    model: Arc<dyn LearnedModel>,
}

impl LearnedStrategy {
    pub fn new(model: Arc<dyn LearnedModel>) -> Self {
        LearnedStrategy { model }
    }
}

impl PredictionStrategy for LearnedStrategy {
    fn name(&self) -> &str {
        LEARNED_STRATEGY
    }

    fn predict(
        &self,
        ctx: &PredictionContext<'_>,
        hour_offset: u32,
    ) -> Result<StrategyPrediction, StrategyError> {
        let samples = ctx.history.samples();
        let recent_levels = samples[samples.len().saturating_sub(RECENT_WINDOW)..]
            .iter()
            .map(|s| s.level)
            .collect();

        let input = LearnedModelInput {
            kind: ctx.kind,
            target_time: ctx.target_time(hour_offset),
            hour_offset,
            hour_of_day: ctx.target_hour(hour_offset),
            day_of_week: ctx.target_weekday(hour_offset),
            recent_levels,
            factors: ctx.factors.clone(),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| self.model.predict(&input)))
            .map_err(|_| StrategyError::Panicked(LEARNED_STRATEGY.to_string()))?;

        let (level, confidence) = outcome.map_err(|e| match e {
            LearnedModelError::NotLoaded => StrategyError::Unavailable(LEARNED_STRATEGY.to_string()),
            LearnedModelError::Inference(reason) => StrategyError::Failed {
                name: LEARNED_STRATEGY.to_string(),
                reason,
            },
        })?;

        if !level.is_finite() || !confidence.is_finite() {
            return Err(StrategyError::NonFinite(LEARNED_STRATEGY.to_string()));
        }

        Ok(StrategyPrediction {
            level: clamp_level(level),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}
