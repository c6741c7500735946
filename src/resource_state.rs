//! Resource history ownership
//!
//! A [`ResourceState`] is the append-only sample history of one resource kind.
//! [`ResourceTracker`] owns the state of every kind and is the only write path
//! into them. Each successful append publishes one [`StateChange`] to
//! subscribers after the mutation completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::SampleError;
use crate::models::{ResourceKind, ResourceSample, SampleContext, SourceTag};
use crate::stats::clamp_level;

const NOTIFICATION_CAPACITY: usize = 256;

/// Sample history of one resource kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    kind: ResourceKind,
    samples: Vec<ResourceSample>,
}

impl ResourceState {
    pub fn new(kind: ResourceKind) -> Self {
        ResourceState {
            kind,
            samples: Vec::new(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Samples in chronological order
    pub fn samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Level of the most recent sample
    pub fn current_level(&self) -> Option<f64> {
        self.samples.last().map(|s| clamp_level(s.level))
    }

    pub fn latest(&self) -> Option<&ResourceSample> {
        self.samples.last()
    }

    /// Samples whose timestamps fall within `[from, to]`
    pub fn between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> &[ResourceSample] {
        let start = self.samples.partition_point(|s| s.timestamp < from);
        let end = self.samples.partition_point(|s| s.timestamp <= to);
        &self.samples[start..end.max(start)]
    }

    /// Sample nearest to `at`, if one lies within `tolerance`
    pub fn nearest(
        &self,
        at: DateTime<Utc>,
        tolerance: chrono::Duration,
    ) -> Option<&ResourceSample> {
        self.between(at - tolerance, at + tolerance)
            .iter()
            .min_by_key(|s| (s.timestamp - at).num_seconds().abs())
    }

    fn append(&mut self, sample: ResourceSample) -> Result<(), SampleError> {
        if let Some(latest) = self.samples.last() {
            if sample.timestamp < latest.timestamp {
                return Err(SampleError::OutOfOrder {
                    kind: self.kind,
                    timestamp: sample.timestamp,
                    latest: latest.timestamp,
                });
            }
        }
        self.samples.push(sample);
        Ok(())
    }
}

/// Notification published after every append
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub kind: ResourceKind,
    pub sample_id: Uuid,
    pub previous_level: Option<f64>,
    pub level: f64,
    pub source: SourceTag,
    pub at: DateTime<Utc>,
}

/// A sample awaiting import, e.g. from a CSV export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: ResourceKind,
    pub level: f64,
    pub source: SourceTag,
    #[serde(default)]
    pub context: SampleContext,
}

/// Owner of every resource history
pub struct ResourceTracker {
    clock: Arc<dyn Clock>,
    states: BTreeMap<ResourceKind, ResourceState>,
    notifier: broadcast::Sender<StateChange>,
    revision: u64,
}

impl ResourceTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let states = ResourceKind::ALL
            .iter()
            .map(|kind| (*kind, ResourceState::new(*kind)))
            .collect();

        ResourceTracker {
            clock,
            states,
            notifier,
            revision: 0,
        }
    }

    /// Record a sample stamped with the current clock time
    pub fn record_sample(
        &mut self,
        kind: ResourceKind,
        level: f64,
        source: SourceTag,
        context: SampleContext,
    ) -> Result<ResourceSample, SampleError> {
        let now = self.clock.now();
        self.record_sample_at(kind, level, source, context, now)
    }

    /// Record a sample with an explicit timestamp, which must not precede
    /// the latest sample of the same kind
    pub fn record_sample_at(
        &mut self,
        kind: ResourceKind,
        level: f64,
        source: SourceTag,
        context: SampleContext,
        timestamp: DateTime<Utc>,
    ) -> Result<ResourceSample, SampleError> {
        if level.is_nan() {
            return Err(SampleError::NonFiniteLevel { kind });
        }

        let sample = ResourceSample::new(kind, level, source, context, timestamp);
        let state = self
            .states
            .entry(kind)
            .or_insert_with(|| ResourceState::new(kind));
        let previous_level = state.current_level();
        state.append(sample.clone())?;
        self.revision += 1;

        debug!(
            kind = %kind,
            level = sample.level,
            source = ?source,
            "Recorded resource sample"
        );

        // No subscribers is fine; the change is simply unobserved
        let _ = self.notifier.send(StateChange {
            kind,
            sample_id: sample.id,
            previous_level,
            level: sample.level,
            source,
            at: sample.timestamp,
        });

        Ok(sample)
    }

    /// Append a batch of records in order, stopping at the first rejection
    pub fn import(&mut self, records: Vec<SampleRecord>) -> Result<usize, SampleError> {
        let mut imported = 0;
        for record in records {
            self.record_sample_at(
                record.kind,
                record.level,
                record.source,
                record.context,
                record.timestamp,
            )?;
            imported += 1;
        }
        Ok(imported)
    }

    pub fn state(&self, kind: ResourceKind) -> &ResourceState {
        // Every kind is inserted at construction
        &self.states[&kind]
    }

    pub fn current_level(&self, kind: ResourceKind) -> Option<f64> {
        self.state(kind).current_level()
    }

    /// Monotonic counter bumped on every append
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.notifier.subscribe()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn tracker() -> (ResourceTracker, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 9, 23, 8, 0, 0).unwrap());
        (ResourceTracker::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_record_clamps_level() {
        let (mut tracker, _) = tracker();
        let sample = tracker
            .record_sample(ResourceKind::Energy, 180.0, SourceTag::Manual, SampleContext::default())
            .unwrap();

        assert_eq!(sample.level, 100.0);
        assert_eq!(tracker.current_level(ResourceKind::Energy), Some(100.0));
        assert_eq!(tracker.current_level(ResourceKind::Social), None);
    }

    #[test]
    fn test_nan_rejected() {
        let (mut tracker, _) = tracker();
        let result = tracker.record_sample(
            ResourceKind::Social,
            f64::NAN,
            SourceTag::Manual,
            SampleContext::default(),
        );
        assert_eq!(
            result,
            Err(SampleError::NonFiniteLevel {
                kind: ResourceKind::Social
            })
        );
        assert_eq!(tracker.revision(), 0);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let (mut tracker, clock) = tracker();
        tracker
            .record_sample(ResourceKind::Energy, 60.0, SourceTag::Manual, SampleContext::default())
            .unwrap();

        let earlier = clock.now() - Duration::hours(1);
        let result = tracker.record_sample_at(
            ResourceKind::Energy,
            50.0,
            SourceTag::Manual,
            SampleContext::default(),
            earlier,
        );
        assert!(matches!(result, Err(SampleError::OutOfOrder { .. })));
        assert_eq!(tracker.state(ResourceKind::Energy).len(), 1);
    }

    #[test]
    fn test_change_published_after_append() {
        let (mut tracker, clock) = tracker();
        let mut rx = tracker.subscribe();

        tracker
            .record_sample(ResourceKind::Energy, 70.0, SourceTag::Manual, SampleContext::default())
            .unwrap();
        clock.advance(Duration::minutes(30));
        tracker
            .record_sample(ResourceKind::Energy, 55.0, SourceTag::Consumption, SampleContext::default())
            .unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.previous_level, None);
        assert_eq!(first.level, 70.0);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.previous_level, Some(70.0));
        assert_eq!(second.level, 55.0);
        assert_eq!(second.source, SourceTag::Consumption);
    }

    #[test]
    fn test_nearest_within_tolerance() {
        let (mut tracker, clock) = tracker();
        let base = clock.now();
        for (minutes, level) in [(0, 60.0), (50, 55.0), (130, 40.0)] {
            tracker
                .record_sample_at(
                    ResourceKind::Energy,
                    level,
                    SourceTag::Decay,
                    SampleContext::default(),
                    base + Duration::minutes(minutes),
                )
                .unwrap();
        }

        let state = tracker.state(ResourceKind::Energy);
        let found = state.nearest(base + Duration::minutes(60), Duration::minutes(30));
        assert_eq!(found.map(|s| s.level), Some(55.0));
        assert!(state
            .nearest(base + Duration::minutes(95), Duration::minutes(30))
            .is_none());
    }
}
