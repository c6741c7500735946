//! Historical pattern-match strategy
//!
//! Averages past samples recorded at the same hour of day and day of week as
//! the target. Confidence grows with the number of matches and shrinks with
//! their variance.

use serde::{Deserialize, Serialize};

use super::strategy::{PredictionContext, PredictionStrategy, StrategyError, StrategyPrediction};
use crate::stats::{clamp_level, mean, population_variance};

pub const PATTERN_STRATEGY: &str = "pattern";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Confidence cap when only same-hour samples on other weekdays match
    pub hour_only_confidence_cap: f64,

    /// Confidence when nothing matches the target hour
    pub fallback_confidence: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        PatternConfig {
            hour_only_confidence_cap: 0.3,
            fallback_confidence: 0.1,
        }
    }
}

pub struct PatternStrategy {
    config: PatternConfig,
    default_level: f64,
}

impl PatternStrategy {
    pub fn new(config: PatternConfig, default_level: f64) -> Self {
        PatternStrategy {
            config,
            default_level: clamp_level(default_level),
        }
    }

    fn matched_confidence(levels: &[f64]) -> f64 {
        let n = levels.len() as f64;
        let variance = population_variance(levels);
        (n / (n + 1.0)) * (1.0 / (1.0 + variance / 100.0))
    }
}

impl PredictionStrategy for PatternStrategy {
    fn name(&self) -> &str {
        PATTERN_STRATEGY
    }

    fn predict(
        &self,
        ctx: &PredictionContext<'_>,
        hour_offset: u32,
    ) -> Result<StrategyPrediction, StrategyError> {
        let hour = ctx.target_hour(hour_offset);
        let weekday = ctx.target_weekday(hour_offset);

        let exact = ctx.profile.slot_levels(hour, weekday);
        if let Some(level) = mean(exact) {
            return Ok(StrategyPrediction {
                level: clamp_level(level),
                confidence: Self::matched_confidence(exact),
            });
        }

        let same_hour = ctx.profile.hour_levels(hour);
        if let Some(level) = mean(same_hour) {
            return Ok(StrategyPrediction {
                level: clamp_level(level),
                confidence: Self::matched_confidence(same_hour)
                    .min(self.config.hour_only_confidence_cap),
            });
        }

        Ok(StrategyPrediction {
            level: ctx.profile.overall_mean.unwrap_or(self.default_level),
            confidence: self
                .config
                .fallback_confidence
                .min(self.config.hour_only_confidence_cap),
        })
    }
}
