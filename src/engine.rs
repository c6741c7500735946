//! Capacity engine
//!
//! Wires the resource tracker, forecaster, accuracy tracker and schedule
//! optimizer behind one handle. All history writes go through
//! [`CapacityEngine::record_sample`] and friends; forecasts are cached per
//! resource and horizon and registered for accuracy feedback the first time they are
//! issued.

use chrono::{DateTime, Duration, DurationRound, Utc};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accuracy::{AccuracyRecord, AccuracyTracker, OutcomeReport};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::conflicts::{Conflict, ConflictDetector};
use crate::error::{ForecastError, Result};
use crate::forecast::{Forecast, Forecaster, LearnedModel};
use crate::models::{validate_schedule, ExternalFactors, ResourceKind, ResourceSample, SampleContext, ScheduleItem, SourceTag};
use crate::optimizer::{ForecastSource, OptimizationResult, ScheduleOptimizer};
use crate::resource_state::{ResourceState, ResourceTracker, SampleRecord, StateChange};

/// Inputs a cached forecast was computed from
#[derive(Debug, Clone, PartialEq)]
struct ForecastKey {
    anchor: DateTime<Utc>,
    horizon_hours: u32,
    revision: u64,
    generation: u64,
    factors: Option<ExternalFactors>,
}

pub struct CapacityEngine {
    config: EngineConfig,
    tracker: ResourceTracker,
    forecaster: Forecaster,
    accuracy: AccuracyTracker,
    optimizer: ScheduleOptimizer,
    cache: ForecastCache,
}

/// Latest forecast per (resource, horizon)
type ForecastCache = HashMap<(ResourceKind, u32), (ForecastKey, Forecast)>;

impl CapacityEngine {
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let optimizer = ScheduleOptimizer::new(
            config.optimizer.clone(),
            ConflictDetector::new(config.conflicts.clone()),
        );

        CapacityEngine {
            tracker: ResourceTracker::new(clock),
            forecaster: Forecaster::new(config.forecast.clone()),
            accuracy: AccuracyTracker::new(config.accuracy.clone()),
            optimizer,
            cache: HashMap::new(),
            config,
        }
    }

    /// Add a learned model to the ensemble. Trust weights reset to equal shares.
    pub fn with_learned_model(mut self, model: Arc<dyn LearnedModel>) -> Self {
        self.forecaster = Forecaster::new(self.config.forecast.clone()).with_learned_model(model);
        self.cache.clear();
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.tracker.clock()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.tracker.clock().now()
    }

    pub fn state(&self, kind: ResourceKind) -> &ResourceState {
        self.tracker.state(kind)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tracker.subscribe()
    }

    pub fn strategy_weights(&self) -> &BTreeMap<String, f64> {
        self.forecaster.strategy_weights()
    }

    pub fn accuracy_records(&self) -> &[AccuracyRecord] {
        self.accuracy.records()
    }

    pub fn record_sample(
        &mut self,
        kind: ResourceKind,
        level: f64,
        source: SourceTag,
        context: SampleContext,
    ) -> Result<ResourceSample> {
        Ok(self.tracker.record_sample(kind, level, source, context)?)
    }

    pub fn record_sample_at(
        &mut self,
        kind: ResourceKind,
        level: f64,
        source: SourceTag,
        context: SampleContext,
        timestamp: DateTime<Utc>,
    ) -> Result<ResourceSample> {
        Ok(self
            .tracker
            .record_sample_at(kind, level, source, context, timestamp)?)
    }

    pub fn import_samples(&mut self, records: Vec<SampleRecord>) -> Result<usize> {
        let imported = self.tracker.import(records)?;
        info!(imported, "Sample history imported");
        Ok(imported)
    }

    fn key_for(
        &self,
        horizon_hours: u32,
        factors: Option<&ExternalFactors>,
        now: DateTime<Utc>,
    ) -> ForecastKey {
        ForecastKey {
            anchor: now.duration_trunc(Duration::hours(1)).unwrap_or(now),
            horizon_hours,
            revision: self.tracker.revision(),
            generation: self.forecaster.weight_generation(),
            factors: factors.filter(|f| !f.is_empty()).cloned(),
        }
    }

    /// Reject horizons outside 1..=max before any forecasting work
    fn check_horizon(&self, horizon_hours: u32) -> Result<()> {
        let max = self.config.forecast.max_horizon_hours;
        if horizon_hours == 0 || horizon_hours > max {
            return Err(ForecastError::InvalidHorizon {
                hours: horizon_hours,
                max,
            }
            .into());
        }
        Ok(())
    }

    /// Cache a forecast and register it for accuracy feedback
    fn remember(&mut self, key: ForecastKey, forecast: &Forecast) {
        self.accuracy.register(forecast);
        self.cache
            .insert((forecast.kind, forecast.horizon_hours), (key, forecast.clone()));
    }

    /// Forecast one resource. Repeated calls over an unchanged history
    /// return the same forecast.
    pub fn forecast(
        &mut self,
        kind: ResourceKind,
        horizon_hours: u32,
        factors: Option<&ExternalFactors>,
    ) -> Result<Forecast> {
        let now = self.now();
        let key = self.key_for(horizon_hours, factors, now);

        if let Some((cached_key, cached)) = self.cache.get(&(kind, horizon_hours)) {
            if *cached_key == key {
                debug!(kind = %kind, forecast_id = %cached.id, "Forecast served from cache");
                return Ok(cached.clone());
            }
        }

        let forecast = self
            .forecaster
            .forecast(self.tracker.state(kind), horizon_hours, factors, now)?;
        self.remember(key, &forecast);
        Ok(forecast)
    }

    /// Forecast energy and social capacity in parallel
    pub fn forecast_all(
        &mut self,
        horizon_hours: u32,
        factors: Option<&ExternalFactors>,
    ) -> Result<(Forecast, Forecast)> {
        let now = self.now();
        let key = self.key_for(horizon_hours, factors, now);

        let (energy, social) = {
            let forecaster = &self.forecaster;
            let tracker = &self.tracker;
            rayon::join(
                || forecaster.forecast(tracker.state(ResourceKind::Energy), horizon_hours, factors, now),
                || forecaster.forecast(tracker.state(ResourceKind::Social), horizon_hours, factors, now),
            )
        };
        let (energy, social) = (energy?, social?);

        self.remember(key.clone(), &energy);
        self.remember(key, &social);
        Ok((energy, social))
    }

    /// Conflicts of a schedule against forecasts of every resource with history
    pub fn detect_conflicts(
        &mut self,
        schedule: &[ScheduleItem],
        horizon_hours: u32,
    ) -> Result<Vec<Conflict>> {
        let items = validate_schedule(schedule)?;
        self.check_horizon(horizon_hours)?;
        let mut forecasts = Vec::new();
        for kind in ResourceKind::ALL {
            if !self.tracker.state(kind).is_empty() {
                forecasts.push(self.forecast(kind, horizon_hours, None)?);
            }
        }
        Ok(self.optimizer.detector().detect(&items, &forecasts))
    }

    pub fn optimize(
        &mut self,
        schedule: &[ScheduleItem],
        horizon_hours: u32,
    ) -> Result<OptimizationResult> {
        self.optimize_with_cancel(schedule, horizon_hours, &CancellationToken::new())
    }

    /// Optimize a schedule; cancelling `cancel` returns the original schedule
    pub fn optimize_with_cancel(
        &mut self,
        schedule: &[ScheduleItem],
        horizon_hours: u32,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult> {
        self.check_horizon(horizon_hours)?;
        let now = self.now();
        let key = self.key_for(horizon_hours, None, now);

        let context = ForecastContext {
            forecaster: &self.forecaster,
            tracker: &self.tracker,
            cache: &self.cache,
            key: &key,
            now,
            issued: RefCell::new(Vec::new()),
        };
        let result = self
            .optimizer
            .optimize_with_cancel(&context, schedule, horizon_hours, cancel)?;

        for forecast in context.issued.into_inner() {
            self.remember(key.clone(), &forecast);
        }
        Ok(result)
    }

    /// Evaluate a forecast against realized history and apply the new weights
    pub fn record_outcome(&mut self, forecast_id: Uuid) -> Result<OutcomeReport> {
        let now = self.now();
        let report = self.accuracy.record_outcome(
            forecast_id,
            &self.tracker,
            self.forecaster.strategy_weights(),
            now,
        )?;

        if let OutcomeReport::Evaluated {
            updated_weights, ..
        } = &report
        {
            self.forecaster.set_strategy_weights(updated_weights);
            self.cache.clear();
        }
        Ok(report)
    }

    /// Evaluate every registered forecast whose horizon has elapsed
    pub fn evaluate_due_forecasts(&mut self) -> Result<usize> {
        let due = self.accuracy.due_forecasts(self.now());
        let mut evaluated = 0;
        for forecast_id in due {
            if let OutcomeReport::Evaluated { .. } = self.record_outcome(forecast_id)? {
                evaluated += 1;
            }
        }
        if evaluated > 0 {
            info!(evaluated, weights = ?self.forecaster.strategy_weights(), "Due forecasts evaluated");
        }
        Ok(evaluated)
    }

    /// Recompute forecasts for every resource with history
    pub fn refresh_forecasts(&mut self, horizon_hours: u32) -> Result<Vec<Forecast>> {
        let mut refreshed = Vec::new();
        for kind in ResourceKind::ALL {
            if self.tracker.state(kind).is_empty() {
                debug!(kind = %kind, "Skipping refresh, no history");
                continue;
            }
            refreshed.push(self.forecast(kind, horizon_hours, None)?);
        }
        Ok(refreshed)
    }
}

/// Forecasts for one optimization pass, served from the engine cache when
/// possible. Newly computed forecasts are collected for registration.
pub struct ForecastContext<'a> {
    forecaster: &'a Forecaster,
    tracker: &'a ResourceTracker,
    cache: &'a ForecastCache,
    key: &'a ForecastKey,
    now: DateTime<Utc>,
    issued: RefCell<Vec<Forecast>>,
}

impl ForecastSource for ForecastContext<'_> {
    fn forecast(&self, kind: ResourceKind, horizon_hours: u32) -> std::result::Result<Forecast, ForecastError> {
        let state = self.tracker.state(kind);
        if state.is_empty() {
            return Err(ForecastError::InsufficientHistory { kind, samples: 0 });
        }

        if let Some((key, cached)) = self.cache.get(&(kind, horizon_hours)) {
            if key == self.key {
                return Ok(cached.clone());
            }
        }

        let forecast = self.forecaster.forecast(state, horizon_hours, None, self.now)?;
        self.issued.borrow_mut().push(forecast.clone());
        Ok(forecast)
    }
}

/// One async mutex per schedule id, so overlapping optimize requests for the
/// same schedule run one at a time
#[derive(Debug, Clone, Default)]
pub struct ScheduleLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ScheduleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, schedule_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| {
            warn!("Schedule lock table poisoned, recovering");
            poisoned.into_inner()
        });
        locks
            .entry(schedule_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to a schedule
    pub async fn acquire(&self, schedule_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(schedule_id).lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::EngineError;
    use crate::models::{ItemKind, ResourceRequirement};
    use crate::optimizer::OptimizationStatus;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 0, 0, 0).unwrap()
    }

    fn seeded_engine(hours: i64) -> (CapacityEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let mut engine = CapacityEngine::new(EngineConfig::default(), clock.clone());
        for h in 0..hours {
            let at = start() + Duration::hours(h);
            for kind in ResourceKind::ALL {
                engine
                    .record_sample_at(kind, 60.0, SourceTag::Manual, SampleContext::default(), at)
                    .unwrap();
            }
        }
        clock.set(start() + Duration::hours(hours));
        (engine, clock)
    }

    #[test]
    fn test_forecast_cached_until_history_changes() {
        let (mut engine, _clock) = seeded_engine(48);
        let first = engine.forecast(ResourceKind::Energy, 24, None).unwrap();
        let second = engine.forecast(ResourceKind::Energy, 24, None).unwrap();
        assert_eq!(first, second);

        engine
            .record_sample(ResourceKind::Energy, 20.0, SourceTag::Manual, SampleContext::default())
            .unwrap();
        let third = engine.forecast(ResourceKind::Energy, 24, None).unwrap();
        assert_ne!(first.id, third.id);
    }

    #[test]
    fn test_forecast_stable_across_alternating_horizons() {
        let (mut engine, clock) = seeded_engine(48);
        let first = engine.forecast(ResourceKind::Energy, 24, None).unwrap();
        clock.advance(Duration::minutes(10));
        let short = engine.forecast(ResourceKind::Energy, 12, None).unwrap();
        let third = engine.forecast(ResourceKind::Energy, 24, None).unwrap();

        assert_eq!(short.points.len(), 12);
        assert_ne!(short.id, first.id);
        assert_eq!(first, third);
        assert_eq!(third.generated_at, first.anchor);

        // Recomputed from scratch after the cache is dropped
        engine.cache.clear();
        assert_eq!(engine.forecast(ResourceKind::Energy, 24, None).unwrap(), first);
    }

    #[test]
    fn test_out_of_range_horizon_rejected() {
        let (mut engine, _clock) = seeded_engine(72);
        let item = ScheduleItem::new(
            "a",
            ItemKind::Task,
            start() + Duration::hours(80),
            60,
            ResourceRequirement::new(50.0, 0.0),
        )
        .unwrap();
        let max = engine.config().forecast.max_horizon_hours;

        for hours in [0, max + 1] {
            assert!(matches!(
                engine.optimize(&[item.clone()], hours),
                Err(EngineError::Forecast(ForecastError::InvalidHorizon { .. }))
            ));
            assert!(matches!(
                engine.detect_conflicts(&[item.clone()], hours),
                Err(EngineError::Forecast(ForecastError::InvalidHorizon { .. }))
            ));
        }
        assert!(engine.optimize(&[item], max).is_ok());
    }

    #[test]
    fn test_forecast_all_matches_single_forecasts() {
        let (mut engine, _clock) = seeded_engine(48);
        let (energy, social) = engine.forecast_all(12, None).unwrap();
        assert_eq!(energy.kind, ResourceKind::Energy);
        assert_eq!(social.kind, ResourceKind::Social);
        assert_eq!(engine.forecast(ResourceKind::Energy, 12, None).unwrap(), energy);
    }

    #[test]
    fn test_optimize_without_history_falls_back() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut engine = CapacityEngine::new(EngineConfig::default(), clock);
        let item = ScheduleItem::new(
            "a",
            ItemKind::Task,
            start() + Duration::hours(10),
            60,
            ResourceRequirement::new(50.0, 0.0),
        )
        .unwrap();

        let result = engine.optimize(&[item.clone()], 24).unwrap();
        assert_eq!(result.status, OptimizationStatus::InsufficientData);
        assert_eq!(result.revised_schedule, vec![item]);
    }

    #[test]
    fn test_outcome_updates_weights() {
        let (mut engine, clock) = seeded_engine(48);
        let forecast = engine.forecast(ResourceKind::Energy, 3, None).unwrap();

        assert!(matches!(
            engine.record_outcome(forecast.id).unwrap(),
            OutcomeReport::NotDue { .. }
        ));

        for _ in 0..4 {
            clock.advance(Duration::hours(1));
            engine
                .record_sample(ResourceKind::Energy, 60.0, SourceTag::Manual, SampleContext::default())
                .unwrap();
        }

        let report = engine.record_outcome(forecast.id).unwrap();
        assert!(matches!(report, OutcomeReport::Evaluated { .. }));
        let total: f64 = engine.strategy_weights().values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(
            engine.record_outcome(forecast.id).unwrap(),
            OutcomeReport::AlreadyEvaluated
        );
    }

    #[tokio::test]
    async fn test_schedule_locks_are_shared_per_id() {
        let locks = ScheduleLocks::new();
        let a = locks.lock_for("week-38");
        let b = locks.lock_for("week-38");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(locks.len(), 1);

        let guard = locks.acquire("week-38").await;
        assert!(a.try_lock().is_err());
        drop(guard);
        assert!(a.try_lock().is_ok());
    }
}
