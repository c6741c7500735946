//! Periodic recomputation jobs
//!
//! [`JobScheduler::run_due`] decides from the engine clock which jobs are
//! due and runs them. It is deterministic under a [`crate::clock::ManualClock`];
//! [`spawn_background`] drives it from a tokio interval in production.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::CapacityEngine;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub reforecast_interval_hours: i64,
    pub accuracy_interval_hours: i64,
    /// Horizon used by the re-forecast job
    pub reforecast_horizon_hours: u32,
    /// Wall-clock seconds between background ticks
    pub tick_seconds: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            reforecast_interval_hours: 4,
            accuracy_interval_hours: 1,
            reforecast_horizon_hours: 24,
            tick_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Reforecast,
    AccuracyEvaluation,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobRunSummary {
    pub ran: Vec<JobKind>,
    pub forecasts_refreshed: usize,
    pub forecasts_evaluated: usize,
    pub errors: Vec<String>,
}

impl JobRunSummary {
    pub fn is_idle(&self) -> bool {
        self.ran.is_empty()
    }
}

pub struct JobScheduler {
    config: JobConfig,
    last_run: HashMap<JobKind, DateTime<Utc>>,
}

impl JobScheduler {
    pub fn new(config: JobConfig) -> Self {
        JobScheduler {
            config,
            last_run: HashMap::new(),
        }
    }

    fn interval(&self, job: JobKind) -> Duration {
        match job {
            JobKind::Reforecast => Duration::hours(self.config.reforecast_interval_hours),
            JobKind::AccuracyEvaluation => Duration::hours(self.config.accuracy_interval_hours),
        }
    }

    /// When a job next becomes due; `None` if it has never run
    pub fn next_due(&self, job: JobKind) -> Option<DateTime<Utc>> {
        self.last_run.get(&job).map(|last| *last + self.interval(job))
    }

    pub fn is_due(&self, job: JobKind, now: DateTime<Utc>) -> bool {
        self.next_due(job).map_or(true, |due| now >= due)
    }

    /// Run every due job once against the engine
    pub fn run_due(&mut self, engine: &mut CapacityEngine) -> JobRunSummary {
        let now = engine.now();
        let mut summary = JobRunSummary::default();

        // Evaluate before refreshing so new forecasts use updated weights
        if self.is_due(JobKind::AccuracyEvaluation, now) {
            match engine.evaluate_due_forecasts() {
                Ok(count) => summary.forecasts_evaluated = count,
                Err(e) => {
                    error!(error = %e, "Accuracy evaluation job failed");
                    summary.errors.push(e.to_string());
                }
            }
            self.last_run.insert(JobKind::AccuracyEvaluation, now);
            summary.ran.push(JobKind::AccuracyEvaluation);
        }

        if self.is_due(JobKind::Reforecast, now) {
            match engine.refresh_forecasts(self.config.reforecast_horizon_hours) {
                Ok(forecasts) => summary.forecasts_refreshed = forecasts.len(),
                Err(e) => {
                    error!(error = %e, "Re-forecast job failed");
                    summary.errors.push(e.to_string());
                }
            }
            self.last_run.insert(JobKind::Reforecast, now);
            summary.ran.push(JobKind::Reforecast);
        }

        if !summary.is_idle() {
            debug!(
                jobs = ?summary.ran,
                refreshed = summary.forecasts_refreshed,
                evaluated = summary.forecasts_evaluated,
                "Background jobs ran"
            );
        }
        summary
    }
}

/// Drive the job scheduler until `cancel` fires
pub fn spawn_background(
    engine: Arc<RwLock<CapacityEngine>>,
    config: JobConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(config.tick_seconds.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scheduler = JobScheduler::new(config);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut engine = engine.write().await;
                    scheduler.run_due(&mut engine);
                }
                _ = cancel.cancelled() => {
                    info!("Background jobs shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::models::{ResourceKind, SampleContext, SourceTag};
    use chrono::TimeZone;

    fn engine_at(start: DateTime<Utc>) -> (CapacityEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let mut engine = CapacityEngine::new(EngineConfig::default(), clock.clone());
        engine
            .record_sample(ResourceKind::Energy, 55.0, SourceTag::Manual, SampleContext::default())
            .unwrap();
        (engine, clock)
    }

    #[test]
    fn test_jobs_follow_intervals() {
        let start = Utc.with_ymd_and_hms(2024, 9, 23, 8, 0, 0).unwrap();
        let (mut engine, clock) = engine_at(start);
        let mut scheduler = JobScheduler::new(JobConfig::default());

        let first = scheduler.run_due(&mut engine);
        assert_eq!(
            first.ran,
            vec![JobKind::AccuracyEvaluation, JobKind::Reforecast]
        );
        assert_eq!(first.forecasts_refreshed, 1);

        clock.advance(Duration::minutes(30));
        assert!(scheduler.run_due(&mut engine).is_idle());

        clock.advance(Duration::minutes(30));
        assert_eq!(
            scheduler.run_due(&mut engine).ran,
            vec![JobKind::AccuracyEvaluation]
        );

        clock.advance(Duration::hours(3));
        assert_eq!(scheduler.run_due(&mut engine).ran.len(), 2);
        assert_eq!(
            scheduler.next_due(JobKind::Reforecast),
            Some(start + Duration::hours(8))
        );
    }

    #[tokio::test]
    async fn test_background_loop_stops_on_cancel() {
        let start = Utc.with_ymd_and_hms(2024, 9, 23, 8, 0, 0).unwrap();
        let (engine, _clock) = engine_at(start);
        let engine = Arc::new(RwLock::new(engine));
        let cancel = CancellationToken::new();

        let handle = spawn_background(engine.clone(), JobConfig::default(), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();

        // The loop released the engine on exit
        assert!(engine.try_write().is_ok());
        assert_eq!(Arc::strong_count(&engine), 1);
    }
}
