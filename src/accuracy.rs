//! Forecast accuracy tracking and strategy trust weights
//!
//! Every issued forecast is registered here. Once its full horizon has
//! elapsed, each point is compared against the realized sample nearest to it
//! (within a tolerance window) and one [`AccuracyRecord`] is written per
//! contributing strategy. Rolling accuracy per strategy then drives the
//! ensemble weights. A forecast is evaluated at most once.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AccuracyError;
use crate::forecast::Forecast;
use crate::resource_state::ResourceTracker;
use crate::stats::mean;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccuracyConfig {
    /// Maximum distance between a forecast point and its realized sample
    pub tolerance_minutes: i64,

    /// Accuracy scores retained per strategy
    pub window_size: usize,

    /// Floor applied to recomputed weights
    pub min_weight: f64,

    /// Forecasts kept awaiting evaluation before the oldest are dropped
    pub max_pending: usize,
}

impl Default for AccuracyConfig {
    fn default() -> Self {
        AccuracyConfig {
            tolerance_minutes: 30,
            window_size: 30,
            min_weight: 0.05,
            max_pending: 500,
        }
    }
}

/// Write-once comparison of one strategy's prediction against reality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyRecord {
    pub forecast_id: Uuid,
    pub strategy: String,
    pub horizon_hours: u32,
    pub absolute_error: f64,
}

impl AccuracyRecord {
    pub fn accuracy(&self) -> f64 {
        100.0 - self.absolute_error
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeReport {
    Evaluated {
        records: Vec<AccuracyRecord>,
        /// Points that found a realized sample
        matched_points: usize,
        ensemble_mean_absolute_error: Option<f64>,
        updated_weights: BTreeMap<String, f64>,
    },
    AlreadyEvaluated,
    NotDue {
        due_at: DateTime<Utc>,
    },
}

pub struct AccuracyTracker {
    config: AccuracyConfig,
    pending: HashMap<Uuid, Forecast>,
    evaluated: HashSet<Uuid>,
    records: Vec<AccuracyRecord>,
    windows: HashMap<String, VecDeque<f64>>,
}

impl AccuracyTracker {
    pub fn new(config: AccuracyConfig) -> Self {
        AccuracyTracker {
            config,
            pending: HashMap::new(),
            evaluated: HashSet::new(),
            records: Vec::new(),
            windows: HashMap::new(),
        }
    }

    /// Keep a forecast for later evaluation. Re-registration is ignored.
    pub fn register(&mut self, forecast: &Forecast) {
        if self.evaluated.contains(&forecast.id) || self.pending.contains_key(&forecast.id) {
            return;
        }

        if self.pending.len() >= self.config.max_pending {
            if let Some(oldest) = self
                .pending
                .values()
                .min_by_key(|f| f.generated_at)
                .map(|f| f.id)
            {
                debug!(forecast_id = %oldest, "Dropping oldest pending forecast");
                self.pending.remove(&oldest);
            }
        }

        self.pending.insert(forecast.id, forecast.clone());
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_evaluated(&self, forecast_id: &Uuid) -> bool {
        self.evaluated.contains(forecast_id)
    }

    /// Instant after which a forecast may be evaluated
    pub fn due_at(forecast: &Forecast) -> DateTime<Utc> {
        forecast
            .covers_until()
            .max(forecast.generated_at + Duration::hours(1))
    }

    /// Pending forecasts whose horizon has fully elapsed, oldest first
    pub fn due_forecasts(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due: Vec<&Forecast> = self
            .pending
            .values()
            .filter(|f| Self::due_at(f) <= now)
            .collect();
        due.sort_by_key(|f| (f.generated_at, f.id));
        due.into_iter().map(|f| f.id).collect()
    }

    pub fn records(&self) -> &[AccuracyRecord] {
        &self.records
    }

    /// Mean of the rolling accuracy window for a strategy
    pub fn average_accuracy(&self, strategy: &str) -> Option<f64> {
        self.windows
            .get(strategy)
            .and_then(|w| mean(&w.iter().copied().collect::<Vec<_>>()))
    }

    /// Evaluate a forecast against realized history and rebalance weights
    pub fn record_outcome(
        &mut self,
        forecast_id: Uuid,
        history: &ResourceTracker,
        current_weights: &BTreeMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<OutcomeReport, AccuracyError> {
        if self.evaluated.contains(&forecast_id) {
            return Ok(OutcomeReport::AlreadyEvaluated);
        }

        let forecast = self
            .pending
            .get(&forecast_id)
            .ok_or(AccuracyError::UnknownForecast(forecast_id))?;

        let due_at = Self::due_at(forecast);
        if now < due_at {
            return Ok(OutcomeReport::NotDue { due_at });
        }

        let tolerance = Duration::minutes(self.config.tolerance_minutes);
        let realized = history.state(forecast.kind);
        let mut records = Vec::new();
        let mut ensemble_errors = Vec::new();

        for point in &forecast.points {
            let Some(actual) = realized.nearest(point.time, tolerance) else {
                continue;
            };
            ensemble_errors.push((point.predicted_level - actual.level).abs());

            for (strategy, predicted) in &point.contributions {
                records.push(AccuracyRecord {
                    forecast_id,
                    strategy: strategy.clone(),
                    horizon_hours: point.hour_offset,
                    absolute_error: (predicted - actual.level).abs(),
                });
            }
        }

        let matched_points = ensemble_errors.len();
        self.pending.remove(&forecast_id);
        self.evaluated.insert(forecast_id);

        for record in &records {
            let window = self.windows.entry(record.strategy.clone()).or_default();
            window.push_back(record.accuracy());
            while window.len() > self.config.window_size {
                window.pop_front();
            }
        }
        self.records.extend(records.iter().cloned());

        let updated_weights = self.rebalanced_weights(current_weights);

        info!(
            forecast_id = %forecast_id,
            matched_points,
            records = records.len(),
            weights = ?updated_weights,
            "Forecast accuracy evaluated"
        );

        Ok(OutcomeReport::Evaluated {
            records,
            matched_points,
            ensemble_mean_absolute_error: mean(&ensemble_errors),
            updated_weights,
        })
    }

    /// Redistribute the weight mass of strategies with accuracy data in
    /// proportion to their average accuracy. Strategies without data keep
    /// their previous weight.
    pub fn rebalanced_weights(&self, current: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let scored: Vec<(&String, f64)> = current
            .keys()
            .filter_map(|name| {
                self.average_accuracy(name)
                    .map(|accuracy| (name, accuracy.max(0.0)))
            })
            .collect();

        let mass: f64 = scored.iter().map(|(name, _)| current[*name]).sum();
        let total_accuracy: f64 = scored.iter().map(|(_, a)| a).sum();
        if scored.is_empty() || mass <= 0.0 || total_accuracy <= 0.0 {
            return current.clone();
        }

        let floored: Vec<(&String, f64)> = scored
            .iter()
            .map(|(name, accuracy)| (*name, (accuracy / total_accuracy).max(self.config.min_weight)))
            .collect();
        let floored_total: f64 = floored.iter().map(|(_, w)| w).sum();

        let mut updated = current.clone();
        for (name, share) in floored {
            updated.insert(name.clone(), mass * share / floored_total);
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::forecast::{ForecastInsights, PredictionPoint, TrendDirection, TrendSummary};
    use crate::models::{ResourceKind, SampleContext, SourceTag};
    use crate::resource_state::ResourceTracker;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 23, 8, 0, 0).unwrap()
    }

    fn forecast(levels: &[(f64, f64)]) -> Forecast {
        let points = levels
            .iter()
            .enumerate()
            .map(|(i, (trend, pattern))| {
                let mut contributions = BTreeMap::new();
                contributions.insert("trend".to_string(), *trend);
                contributions.insert("pattern".to_string(), *pattern);
                PredictionPoint {
                    hour_offset: i as u32 + 1,
                    time: anchor() + Duration::hours(i as i64 + 1),
                    predicted_level: (trend + pattern) / 2.0,
                    confidence: 0.6,
                    contributions,
                    uncertainty: (trend - pattern).abs() / 2.0,
                }
            })
            .collect::<Vec<_>>();

        Forecast {
            id: Uuid::new_v4(),
            kind: ResourceKind::Energy,
            generated_at: anchor(),
            anchor: anchor(),
            horizon_hours: points.len() as u32,
            points,
            confidence: 0.6,
            degraded: false,
            history_samples: 10,
            strategies_used: vec!["pattern".to_string(), "trend".to_string()],
            insights: ForecastInsights {
                peak_periods: vec![],
                low_periods: vec![],
                trend: TrendSummary {
                    delta: 0.0,
                    direction: TrendDirection::Stable,
                },
                recommendations: vec![],
            },
        }
    }

    fn realized(levels: &[f64]) -> ResourceTracker {
        let mut tracker = ResourceTracker::new(Arc::new(ManualClock::new(anchor())));
        for (i, level) in levels.iter().enumerate() {
            tracker
                .record_sample_at(
                    ResourceKind::Energy,
                    *level,
                    SourceTag::Manual,
                    SampleContext::default(),
                    // Ten minutes off the hour, inside the tolerance window
                    anchor() + Duration::hours(i as i64 + 1) + Duration::minutes(10),
                )
                .unwrap();
        }
        tracker
    }

    fn equal_weights() -> BTreeMap<String, f64> {
        let mut weights = BTreeMap::new();
        weights.insert("trend".to_string(), 0.5);
        weights.insert("pattern".to_string(), 0.5);
        weights
    }

    #[test]
    fn test_not_due_before_horizon_elapses() {
        let mut tracker = AccuracyTracker::new(AccuracyConfig::default());
        let f = forecast(&[(60.0, 60.0), (60.0, 60.0)]);
        tracker.register(&f);

        let history = realized(&[60.0]);
        let report = tracker
            .record_outcome(
                f.id,
                &history,
                &equal_weights(),
                anchor() + Duration::hours(1),
            )
            .unwrap();

        assert_eq!(
            report,
            OutcomeReport::NotDue {
                due_at: anchor() + Duration::hours(2)
            }
        );
        assert!(!tracker.is_evaluated(&f.id));
    }

    #[test]
    fn test_more_accurate_strategy_gains_weight() {
        let mut tracker = AccuracyTracker::new(AccuracyConfig::default());
        // Pattern is exact, trend is 20 points off
        let f = forecast(&[(40.0, 60.0), (50.0, 70.0), (45.0, 65.0)]);
        tracker.register(&f);

        let history = realized(&[60.0, 70.0, 65.0]);
        let report = tracker
            .record_outcome(
                f.id,
                &history,
                &equal_weights(),
                anchor() + Duration::hours(4),
            )
            .unwrap();

        let OutcomeReport::Evaluated {
            records,
            matched_points,
            updated_weights,
            ..
        } = report
        else {
            panic!("expected evaluation");
        };

        assert_eq!(matched_points, 3);
        assert_eq!(records.len(), 6);
        assert_eq!(tracker.average_accuracy("pattern"), Some(100.0));
        assert_eq!(tracker.average_accuracy("trend"), Some(80.0));
        assert!(updated_weights["pattern"] > updated_weights["trend"]);
        let total: f64 = updated_weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((updated_weights["pattern"] - 100.0 / 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_second_evaluation_is_noop() {
        let mut tracker = AccuracyTracker::new(AccuracyConfig::default());
        let f = forecast(&[(60.0, 60.0)]);
        tracker.register(&f);
        let history = realized(&[55.0]);
        let state = &history;
        let later = anchor() + Duration::hours(3);

        tracker
            .record_outcome(f.id, state, &equal_weights(), later)
            .unwrap();
        let records_after_first = tracker.records().len();

        let again = tracker
            .record_outcome(f.id, state, &equal_weights(), later)
            .unwrap();
        assert_eq!(again, OutcomeReport::AlreadyEvaluated);
        assert_eq!(tracker.records().len(), records_after_first);

        // Registering an evaluated forecast again does not resurrect it
        tracker.register(&f);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_unknown_forecast() {
        let mut tracker = AccuracyTracker::new(AccuracyConfig::default());
        let history = realized(&[]);
        let id = Uuid::new_v4();
        assert_eq!(
            tracker.record_outcome(
                id,
                &history,
                &equal_weights(),
                anchor()
            ),
            Err(AccuracyError::UnknownForecast(id))
        );
    }

    #[test]
    fn test_strategies_without_data_keep_weight() {
        let mut tracker = AccuracyTracker::new(AccuracyConfig::default());
        let f = forecast(&[(50.0, 60.0)]);
        tracker.register(&f);
        let history = realized(&[60.0]);

        let mut weights = BTreeMap::new();
        weights.insert("trend".to_string(), 0.3);
        weights.insert("pattern".to_string(), 0.3);
        weights.insert("learned".to_string(), 0.4);

        let report = tracker
            .record_outcome(
                f.id,
                &history,
                &weights,
                anchor() + Duration::hours(2),
            )
            .unwrap();

        let OutcomeReport::Evaluated { updated_weights, .. } = report else {
            panic!("expected evaluation");
        };
        assert_eq!(updated_weights["learned"], 0.4);
        assert!((updated_weights["trend"] + updated_weights["pattern"] - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_due_forecasts() {
        let mut tracker = AccuracyTracker::new(AccuracyConfig::default());
        let short = forecast(&[(60.0, 60.0)]);
        let long = forecast(&[(60.0, 60.0); 6]);
        tracker.register(&short);
        tracker.register(&long);

        assert_eq!(tracker.due_forecasts(anchor() + Duration::hours(2)), vec![short.id]);
        assert_eq!(tracker.due_forecasts(anchor() + Duration::hours(6)).len(), 2);
    }
}
