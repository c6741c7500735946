//! Trend/regression strategy
//!
//! A linear combination of normalised features with hand-tunable
//! coefficients: the most recent level (weighted down as the horizon grows),
//! the historical level at the target hour, a weekday deviation, a circadian
//! prior and the external-factor effect.

use serde::{Deserialize, Serialize};

use super::strategy::{PredictionContext, PredictionStrategy, StrategyError, StrategyPrediction};
use crate::models::ResourceKind;
use crate::stats::{circadian, clamp_level};

pub const TREND_STRATEGY: &str = "trend";

/// Coefficients of the trend model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendCoefficients {
    /// Weight of the most recent level at offset 0
    pub recency_weight: f64,

    /// Per-hour multiplicative decay of the recency weight
    pub recency_decay_per_hour: f64,

    /// Weight of the weekday deviation from the overall mean
    pub day_of_week_weight: f64,

    /// Amplitude of the circadian prior in level points
    pub circadian_amplitude: f64,

    pub energy_peak_hour: u32,

    pub social_peak_hour: u32,

    /// Confidence at offset 0
    pub base_confidence: f64,

    /// Per-hour multiplicative confidence decay
    pub confidence_decay_per_hour: f64,

    /// Confidence floor, also used when history is empty
    pub min_confidence: f64,
}

impl Default for TrendCoefficients {
    fn default() -> Self {
        TrendCoefficients {
            recency_weight: 0.6,
            recency_decay_per_hour: 0.9,
            day_of_week_weight: 0.5,
            circadian_amplitude: 5.0,
            energy_peak_hour: 10,
            social_peak_hour: 15,
            base_confidence: 0.75,
            confidence_decay_per_hour: 0.98,
            min_confidence: 0.2,
        }
    }
}

pub struct TrendStrategy {
    coefficients: TrendCoefficients,
    default_level: f64,
}

impl TrendStrategy {
    pub fn new(coefficients: TrendCoefficients, default_level: f64) -> Self {
        TrendStrategy {
            coefficients,
            default_level: clamp_level(default_level),
        }
    }

    fn peak_hour(&self, kind: ResourceKind) -> u32 {
        match kind {
            ResourceKind::Energy => self.coefficients.energy_peak_hour,
            ResourceKind::Social => self.coefficients.social_peak_hour,
        }
    }
}

impl PredictionStrategy for TrendStrategy {
    fn name(&self) -> &str {
        TREND_STRATEGY
    }

    fn predict(
        &self,
        ctx: &PredictionContext<'_>,
        hour_offset: u32,
    ) -> Result<StrategyPrediction, StrategyError> {
        let c = &self.coefficients;
        let hour = ctx.target_hour(hour_offset);
        let weekday = ctx.target_weekday(hour_offset);
        let overall = ctx.profile.overall_mean.unwrap_or(self.default_level);

        let hour_baseline = ctx.profile.hour_mean(hour).unwrap_or(overall);
        let recent = ctx.history.current_level().unwrap_or(hour_baseline);

        let recency = (c.recency_weight * c.recency_decay_per_hour.powi(hour_offset as i32))
            .clamp(0.0, 1.0);
        let mut level = recency * recent + (1.0 - recency) * hour_baseline;

        if let Some(weekday_mean) = ctx.profile.weekday_mean(weekday) {
            level += c.day_of_week_weight * (weekday_mean - overall);
        }

        level += c.circadian_amplitude * circadian(hour, self.peak_hour(ctx.kind));
        level += ctx.factors.effect(ctx.kind);

        let confidence = if ctx.history.is_empty() {
            c.min_confidence
        } else {
            (c.base_confidence * c.confidence_decay_per_hour.powi(hour_offset as i32))
                .max(c.min_confidence)
        };

        Ok(StrategyPrediction {
            level: clamp_level(level),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }

    fn supports_degraded(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::forecast::strategy::HistoryProfile;
    use crate::models::{ExternalFactors, SampleContext, SourceTag};
    use crate::resource_state::ResourceTracker;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn flat_tracker(level: f64, samples: i64) -> ResourceTracker {
        let start = Utc.with_ymd_and_hms(2024, 9, 2, 0, 0, 0).unwrap();
        let mut tracker = ResourceTracker::new(Arc::new(ManualClock::new(start)));
        for h in 0..samples {
            tracker
                .record_sample_at(
                    ResourceKind::Energy,
                    level,
                    SourceTag::Decay,
                    SampleContext::default(),
                    start + Duration::hours(h),
                )
                .unwrap();
        }
        tracker
    }

    fn no_circadian() -> TrendStrategy {
        TrendStrategy::new(
            TrendCoefficients {
                circadian_amplitude: 0.0,
                ..TrendCoefficients::default()
            },
            50.0,
        )
    }

    #[test]
    fn test_flat_history_predicts_flat() {
        let tracker = flat_tracker(65.0, 48);
        let state = tracker.state(ResourceKind::Energy);
        let profile = HistoryProfile::build(state);
        let factors = ExternalFactors::default();
        let ctx = PredictionContext {
            kind: ResourceKind::Energy,
            history: state,
            profile: &profile,
            factors: &factors,
            anchor: state.latest().unwrap().timestamp,
        };

        let prediction = no_circadian().predict(&ctx, 5).unwrap();
        assert!((prediction.level - 65.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_decays_with_horizon() {
        let tracker = flat_tracker(65.0, 48);
        let state = tracker.state(ResourceKind::Energy);
        let profile = HistoryProfile::build(state);
        let factors = ExternalFactors::default();
        let ctx = PredictionContext {
            kind: ResourceKind::Energy,
            history: state,
            profile: &profile,
            factors: &factors,
            anchor: state.latest().unwrap().timestamp,
        };
        let strategy = no_circadian();

        let near = strategy.predict(&ctx, 1).unwrap();
        let far = strategy.predict(&ctx, 48).unwrap();
        assert!(near.confidence > far.confidence);
        assert!(far.confidence >= TrendCoefficients::default().min_confidence);
    }

    #[test]
    fn test_empty_history_uses_default_level() {
        let tracker = flat_tracker(0.0, 0);
        let state = tracker.state(ResourceKind::Energy);
        let profile = HistoryProfile::build(state);
        let factors = ExternalFactors {
            stress_level: Some(9.0),
            ..ExternalFactors::default()
        };
        let ctx = PredictionContext {
            kind: ResourceKind::Energy,
            history: state,
            profile: &profile,
            factors: &factors,
            anchor: Utc.with_ymd_and_hms(2024, 9, 2, 0, 0, 0).unwrap(),
        };

        let prediction = no_circadian().predict(&ctx, 3).unwrap();
        assert!((prediction.level - 44.0).abs() < 1e-9);
        assert_eq!(prediction.confidence, 0.2);
    }
}
