// Property tests for invariants that must hold for arbitrary inputs

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;

use capacityrs::conflicts::{ConflictConfig, ConflictDetector, ConflictKind};
use capacityrs::forecast::{EnsembleCombiner, StrategyPrediction};
use capacityrs::{
    count_overlaps, CapacityEngine, EngineConfig, ItemCategory, ItemKind, ManualClock, ResourceKind,
    ResourceRequirement, ResourceTracker, SampleContext, ScheduleItem, SourceTag,
};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 23, 0, 0, 0).unwrap()
}

fn level_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![
        -1.0e6..1.0e6f64,
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
        Just(0.0),
        Just(100.0),
    ]
}

fn schedule_strategy() -> impl Strategy<Value = Vec<ScheduleItem>> {
    prop::collection::vec((8u32..20, 0u32..4, 15i64..120, 0.0..100.0f64), 1..8).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (hour, quarter, minutes, energy))| {
                ScheduleItem::new(
                    format!("item-{}", i),
                    ItemKind::Task,
                    base() + Duration::hours(hour as i64) + Duration::minutes(quarter as i64 * 15),
                    minutes,
                    ResourceRequirement::new(energy, 0.0),
                )
                .unwrap()
                .with_category(ItemCategory::Focus)
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_recorded_levels_stay_in_range(levels in prop::collection::vec(level_strategy(), 1..30)) {
        let mut tracker = ResourceTracker::new(Arc::new(ManualClock::new(base())));
        for level in levels {
            let sample = tracker
                .record_sample(ResourceKind::Energy, level, SourceTag::Manual, SampleContext::default())
                .unwrap();
            prop_assert!((0.0..=100.0).contains(&sample.level));
        }
        prop_assert!(tracker
            .state(ResourceKind::Energy)
            .samples()
            .iter()
            .all(|s| (0.0..=100.0).contains(&s.level)));
    }

    #[test]
    fn prop_forecast_points_match_horizon(
        history in prop::collection::vec(0.0..100.0f64, 0..60),
        horizon in 1u32..72,
        offset_minutes in 0i64..60,
    ) {
        let now = base() + Duration::minutes(offset_minutes);
        let mut engine = CapacityEngine::new(EngineConfig::default(), Arc::new(ManualClock::new(now)));
        let start = base() - Duration::hours(history.len() as i64);
        for (h, level) in history.iter().enumerate() {
            engine
                .record_sample_at(
                    ResourceKind::Energy,
                    *level,
                    SourceTag::Decay,
                    SampleContext::default(),
                    start + Duration::hours(h as i64),
                )
                .unwrap();
        }

        let forecast = engine.forecast(ResourceKind::Energy, horizon, None).unwrap();
        prop_assert_eq!(forecast.points.len(), horizon as usize);
        prop_assert!(forecast.points.windows(2).all(|w| w[0].time < w[1].time));
        prop_assert!(forecast
            .points
            .iter()
            .all(|p| (0.0..=100.0).contains(&p.predicted_level) && (0.0..=1.0).contains(&p.confidence)));
    }

    #[test]
    fn prop_confidence_falls_with_spread(
        center in 20.0..80.0f64,
        confidence in 0.0..1.0f64,
        spread in 0.0..20.0f64,
        extra in 0.0..20.0f64,
    ) {
        let combiner = EnsembleCombiner::equal(["trend", "pattern"]);
        let combine = |d: f64| {
            combiner
                .combine(&[
                    ("trend".to_string(), StrategyPrediction { level: center - d, confidence }),
                    ("pattern".to_string(), StrategyPrediction { level: center + d, confidence }),
                ])
                .unwrap()
        };

        let narrow = combine(spread);
        let wide = combine(spread + extra);
        prop_assert!((narrow.level - wide.level).abs() < 1e-9);
        prop_assert!(wide.confidence <= narrow.confidence + 1e-12);
    }

    #[test]
    fn prop_sufficient_gap_never_violates_buffer(
        first_minutes in 15i64..180,
        extra_gap in 0i64..240,
        buffer in 0i64..60,
    ) {
        let detector = ConflictDetector::new(ConflictConfig {
            min_buffer_minutes: buffer,
            ..ConflictConfig::default()
        });
        let start = base() + Duration::hours(9);
        let first = ScheduleItem::new("a", ItemKind::Event, start, first_minutes, ResourceRequirement::default()).unwrap();
        let second = ScheduleItem::new(
            "b",
            ItemKind::Event,
            first.end() + Duration::minutes(buffer + extra_gap),
            30,
            ResourceRequirement::default(),
        )
        .unwrap();

        let conflicts = detector.detect(&[first, second], &[]);
        prop_assert!(conflicts.iter().all(|c| c.kind != ConflictKind::BufferViolation));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_optimizer_adds_no_overlaps(schedule in schedule_strategy(), level in 20.0..70.0f64) {
        let mut engine = CapacityEngine::new(EngineConfig::default(), Arc::new(ManualClock::new(base())));
        let start = base() - Duration::days(2);
        for h in 0..48 {
            engine
                .record_sample_at(
                    ResourceKind::Energy,
                    level,
                    SourceTag::Decay,
                    SampleContext::default(),
                    start + Duration::hours(h),
                )
                .unwrap();
        }

        let result = engine.optimize(&schedule, 36).unwrap();
        prop_assert!(count_overlaps(&result.revised_schedule) <= count_overlaps(&schedule));
        prop_assert_eq!(
            result.revised_schedule.len(),
            schedule.len() + result.recovery_blocks.len()
        );
    }
}
