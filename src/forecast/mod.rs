//! Ensemble forecasting of resource levels
//!
//! The [`Forecaster`] runs every available [`PredictionStrategy`] for each
//! hour of the requested horizon and blends their outputs through the
//! [`EnsembleCombiner`]. With fewer than `min_samples_for_ensemble` samples it
//! runs in degraded mode: only strategies that support it (the trend model)
//! contribute, and confidence is capped.
//!
//! Forecast ids are derived from the inputs, so two calls over the same
//! history snapshot, factors and weights produce identical forecasts.

pub mod ensemble;
pub mod insights;
pub mod learned;
pub mod pattern;
pub mod strategy;
pub mod trend;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ForecastError;
use crate::models::{ExternalFactors, ResourceKind};
use crate::resource_state::ResourceState;

pub use ensemble::{CombinedPrediction, EnsembleCombiner};
pub use insights::{ForecastInsights, InsightConfig, Period, TrendDirection, TrendSummary};
pub use learned::{LearnedModel, LearnedModelError, LearnedModelInput, LearnedStrategy, LEARNED_STRATEGY};
pub use pattern::{PatternConfig, PatternStrategy, PATTERN_STRATEGY};
pub use strategy::{
    HistoryProfile, PredictionContext, PredictionStrategy, StrategyError, StrategyPrediction,
};
pub use trend::{TrendCoefficients, TrendStrategy, TREND_STRATEGY};

/// Forecaster configuration with tunable defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Samples required before non-degraded strategies take part
    pub min_samples_for_ensemble: usize,

    /// Confidence cap applied in degraded mode
    pub degraded_confidence_cap: f64,

    /// Level assumed when no history exists
    pub default_level: f64,

    /// Longest accepted horizon in hours
    pub max_horizon_hours: u32,

    pub trend: TrendCoefficients,

    pub pattern: PatternConfig,

    pub insights: InsightConfig,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        ForecastConfig {
            min_samples_for_ensemble: 7,
            degraded_confidence_cap: 0.5,
            default_level: 50.0,
            max_horizon_hours: 14 * 24,
            trend: TrendCoefficients::default(),
            pattern: PatternConfig::default(),
            insights: InsightConfig::default(),
        }
    }
}

/// Predicted level for one future hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPoint {
    pub hour_offset: u32,
    pub time: DateTime<Utc>,
    pub predicted_level: f64,
    pub confidence: f64,
    /// Strategy name to that strategy's predicted level
    pub contributions: BTreeMap<String, f64>,
    /// Standard deviation across strategy predictions
    pub uncertainty: f64,
}

/// Hour-by-hour forecast of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub id: Uuid,
    pub kind: ResourceKind,
    /// Snapshot instant the forecast describes. Equal to `anchor`, so a
    /// recomputation over the same snapshot yields an identical forecast.
    pub generated_at: DateTime<Utc>,
    /// Start of the hour the forecast was requested in
    pub anchor: DateTime<Utc>,
    pub horizon_hours: u32,
    pub points: Vec<PredictionPoint>,
    pub confidence: f64,
    pub degraded: bool,
    pub history_samples: usize,
    pub strategies_used: Vec<String>,
    pub insights: ForecastInsights,
}

impl Forecast {
    /// Time after which every forecast hour has been observed
    pub fn covers_until(&self) -> DateTime<Utc> {
        self.points
            .last()
            .map(|p| p.time)
            .unwrap_or(self.anchor)
    }

    /// Point whose time lies within `tolerance` of `at`, nearest first
    pub fn point_near(&self, at: DateTime<Utc>, tolerance: Duration) -> Option<&PredictionPoint> {
        self.points
            .iter()
            .filter(|p| (p.time - at).num_seconds().abs() <= tolerance.num_seconds())
            .min_by_key(|p| (p.time - at).num_seconds().abs())
    }

    /// Mean predicted level over points falling on `date`
    pub fn average_level_on(&self, date: chrono::NaiveDate) -> Option<f64> {
        let levels: Vec<f64> = self
            .points
            .iter()
            .filter(|p| p.time.date_naive() == date)
            .map(|p| p.predicted_level)
            .collect();
        crate::stats::mean(&levels)
    }
}

/// Ensemble forecaster
pub struct Forecaster {
    config: ForecastConfig,
    strategies: Vec<Box<dyn PredictionStrategy>>,
    combiner: EnsembleCombiner,
}

impl Forecaster {
    /// Forecaster with the trend and pattern strategies
    pub fn new(config: ForecastConfig) -> Self {
        let strategies: Vec<Box<dyn PredictionStrategy>> = vec![
            Box::new(TrendStrategy::new(config.trend.clone(), config.default_level)),
            Box::new(PatternStrategy::new(config.pattern.clone(), config.default_level)),
        ];
        Self::with_strategies(config, strategies)
    }

    /// Forecaster over an explicit strategy set, with equal initial weights
    pub fn with_strategies(
        config: ForecastConfig,
        strategies: Vec<Box<dyn PredictionStrategy>>,
    ) -> Self {
        let combiner = EnsembleCombiner::equal(strategies.iter().map(|s| s.name().to_string()));
        Forecaster {
            config,
            strategies,
            combiner,
        }
    }

    /// Add the optional learned model. Weights are reset to equal shares.
    pub fn with_learned_model(mut self, model: Arc<dyn LearnedModel>) -> Self {
        self.strategies
            .retain(|s| s.name() != LEARNED_STRATEGY);
        self.strategies.push(Box::new(LearnedStrategy::new(model)));
        self.combiner =
            EnsembleCombiner::equal(self.strategies.iter().map(|s| s.name().to_string()));
        self
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn strategy_weights(&self) -> &BTreeMap<String, f64> {
        self.combiner.weights()
    }

    pub fn set_strategy_weights(&mut self, weights: &BTreeMap<String, f64>) {
        self.combiner.set_weights(weights);
    }

    pub fn weight_generation(&self) -> u64 {
        self.combiner.generation()
    }

    /// Forecast `horizon_hours` hourly points after the hour containing `now`
    pub fn forecast(
        &self,
        state: &ResourceState,
        horizon_hours: u32,
        factors: Option<&ExternalFactors>,
        now: DateTime<Utc>,
    ) -> Result<Forecast, ForecastError> {
        if horizon_hours == 0 || horizon_hours > self.config.max_horizon_hours {
            return Err(ForecastError::InvalidHorizon {
                hours: horizon_hours,
                max: self.config.max_horizon_hours,
            });
        }

        let neutral = ExternalFactors::default();
        let factors = factors.unwrap_or(&neutral);
        let kind = state.kind();
        let anchor = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
        let profile = HistoryProfile::build(state);
        let degraded = profile.sample_count < self.config.min_samples_for_ensemble;

        let ctx = PredictionContext {
            kind,
            history: state,
            profile: &profile,
            factors,
            anchor,
        };

        let active: Vec<&dyn PredictionStrategy> = self
            .strategies
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| !degraded || s.supports_degraded())
            .collect();

        let mut points = Vec::with_capacity(horizon_hours as usize);
        let mut excluded: BTreeMap<String, StrategyError> = BTreeMap::new();
        let mut used: BTreeSet<String> = BTreeSet::new();

        for offset in 1..=horizon_hours {
            let mut outputs = Vec::with_capacity(active.len());
            for strategy in &active {
                match strategy.predict(&ctx, offset) {
                    Ok(prediction) => {
                        used.insert(strategy.name().to_string());
                        outputs.push((strategy.name().to_string(), prediction));
                    }
                    Err(e) => {
                        excluded.entry(strategy.name().to_string()).or_insert(e);
                    }
                }
            }

            let combined = self.combiner.combine(&outputs).unwrap_or(CombinedPrediction {
                level: self.config.default_level,
                confidence: 0.0,
                uncertainty: 0.0,
                contributions: BTreeMap::new(),
            });

            let confidence = if degraded {
                combined.confidence.min(self.config.degraded_confidence_cap)
            } else {
                combined.confidence
            };

            points.push(PredictionPoint {
                hour_offset: offset,
                time: ctx.target_time(offset),
                predicted_level: combined.level,
                confidence,
                contributions: combined.contributions,
                uncertainty: combined.uncertainty,
            });
        }

        for (name, error) in &excluded {
            warn!(strategy = %name, kind = %kind, error = %error, "Strategy excluded from ensemble");
        }
        if degraded {
            warn!(
                kind = %kind,
                samples = profile.sample_count,
                required = self.config.min_samples_for_ensemble,
                "Forecasting in degraded mode"
            );
        }

        let mut confidence =
            points.iter().map(|p| p.confidence).sum::<f64>() / points.len() as f64;
        if degraded {
            confidence = confidence.min(self.config.degraded_confidence_cap);
        }

        let insights = insights::analyze(&points, confidence, &self.config.insights);
        let id = self.forecast_id(state, anchor, horizon_hours, factors);

        debug!(
            forecast_id = %id,
            kind = %kind,
            horizon = horizon_hours,
            confidence,
            peaks = insights.peak_periods.len(),
            lows = insights.low_periods.len(),
            "Forecast computed"
        );

        Ok(Forecast {
            id,
            kind,
            generated_at: anchor,
            anchor,
            horizon_hours,
            points,
            confidence,
            degraded,
            history_samples: profile.sample_count,
            strategies_used: used.into_iter().collect(),
            insights,
        })
    }

    fn forecast_id(
        &self,
        state: &ResourceState,
        anchor: DateTime<Utc>,
        horizon_hours: u32,
        factors: &ExternalFactors,
    ) -> Uuid {
        let latest = state
            .latest()
            .map(|s| s.id.to_string())
            .unwrap_or_default();
        let factors = serde_json::to_string(factors).unwrap_or_default();
        let key = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            state.kind(),
            anchor.to_rfc3339(),
            horizon_hours,
            state.len(),
            latest,
            factors,
            self.combiner.generation()
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
    }
}
