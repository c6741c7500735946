use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{ExternalFactors, ResourceKind};
use crate::resource_state::ResourceState;
use crate::stats::mean;

/// Output of one strategy for one hour offset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyPrediction {
    pub level: f64,
    pub confidence: f64,
}

/// Failure of a single strategy. Contained by the ensemble.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StrategyError {
    #[error("strategy '{0}' is not available")]
    Unavailable(String),

    #[error("strategy '{name}' failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("strategy '{0}' panicked")]
    Panicked(String),

    #[error("strategy '{0}' returned a non-finite prediction")]
    NonFinite(String),
}

/// Level statistics bucketed by calendar position, built once per forecast
#[derive(Debug, Clone, Default)]
pub struct HistoryProfile {
    pub sample_count: usize,
    pub overall_mean: Option<f64>,
    by_hour: HashMap<u32, Vec<f64>>,
    by_weekday: HashMap<u32, Vec<f64>>,
    by_slot: HashMap<(u32, u32), Vec<f64>>,
}

impl HistoryProfile {
    pub fn build(state: &ResourceState) -> Self {
        let mut profile = HistoryProfile {
            sample_count: state.len(),
            ..HistoryProfile::default()
        };

        let mut all = Vec::with_capacity(state.len());
        for sample in state.samples() {
            all.push(sample.level);
            profile
                .by_hour
                .entry(sample.hour_of_day)
                .or_default()
                .push(sample.level);
            profile
                .by_weekday
                .entry(sample.day_of_week)
                .or_default()
                .push(sample.level);
            profile
                .by_slot
                .entry((sample.hour_of_day, sample.day_of_week))
                .or_default()
                .push(sample.level);
        }
        profile.overall_mean = mean(&all);
        profile
    }

    pub fn hour_levels(&self, hour: u32) -> &[f64] {
        self.by_hour.get(&hour).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn slot_levels(&self, hour: u32, weekday: u32) -> &[f64] {
        self.by_slot
            .get(&(hour, weekday))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn hour_mean(&self, hour: u32) -> Option<f64> {
        mean(self.hour_levels(hour))
    }

    pub fn weekday_mean(&self, weekday: u32) -> Option<f64> {
        self.by_weekday.get(&weekday).and_then(|levels| mean(levels))
    }
}

/// Read-only inputs shared by every strategy during one forecast call
pub struct PredictionContext<'a> {
    pub kind: ResourceKind,
    pub history: &'a ResourceState,
    pub profile: &'a HistoryProfile,
    pub factors: &'a ExternalFactors,
    /// Start of the hour the forecast was requested in
    pub anchor: DateTime<Utc>,
}

impl PredictionContext<'_> {
    pub fn target_time(&self, hour_offset: u32) -> DateTime<Utc> {
        self.anchor + Duration::hours(hour_offset as i64)
    }

    pub fn target_hour(&self, hour_offset: u32) -> u32 {
        self.target_time(hour_offset).hour()
    }

    pub fn target_weekday(&self, hour_offset: u32) -> u32 {
        self.target_time(hour_offset)
            .weekday()
            .num_days_from_monday()
    }
}

/// One independent prediction method combined into the ensemble
pub trait PredictionStrategy: Send + Sync {
    /// Stable name used for weights and contributions
    fn name(&self) -> &str;

    fn predict(
        &self,
        ctx: &PredictionContext<'_>,
        hour_offset: u32,
    ) -> Result<StrategyPrediction, StrategyError>;

    /// Whether the strategy runs when history is too short for the ensemble
    fn supports_degraded(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{SampleContext, SourceTag};
    use crate::resource_state::ResourceTracker;
    use chrono::TimeZone;
    use std::sync::Arc;

    #[test]
    fn test_profile_buckets() {
        let start = Utc.with_ymd_and_hms(2024, 9, 23, 9, 0, 0).unwrap();
        let mut tracker = ResourceTracker::new(Arc::new(ManualClock::new(start)));
        for (hours, level) in [(0, 40.0), (1, 60.0), (24, 50.0)] {
            tracker
                .record_sample_at(
                    ResourceKind::Energy,
                    level,
                    SourceTag::Manual,
                    SampleContext::default(),
                    start + Duration::hours(hours),
                )
                .unwrap();
        }

        let profile = HistoryProfile::build(tracker.state(ResourceKind::Energy));
        assert_eq!(profile.sample_count, 3);
        assert_eq!(profile.overall_mean, Some(50.0));
        assert_eq!(profile.hour_mean(9), Some(45.0));
        assert_eq!(profile.slot_levels(9, 0), &[40.0]);
        assert_eq!(profile.weekday_mean(1), Some(50.0));
        assert!(profile.hour_levels(3).is_empty());
    }
}
