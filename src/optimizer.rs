//! Forecast-driven schedule optimization
//!
//! A pass forecasts every resource kind over the horizon, detects conflicts,
//! and moves the items behind high or critical conflicts to the best-scoring
//! free slot. Afterwards buffer hints are attached to tight pairs, recovery
//! blocks are synthesized for heavy days, and before/after metrics are
//! computed.
//!
//! The pass works on a private copy of the schedule. If no resource has
//! history to forecast from, or the pass is cancelled, the original schedule
//! is returned. Every slot evaluation, including the fallback suggestions for
//! unplaceable items, counts against the iteration cap.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conflicts::{adjacent_pairs, items_by_day, Conflict, ConflictDetector, ConflictKind};
use crate::error::{EngineError, ForecastError, ScheduleError};
use crate::forecast::Forecast;
use crate::models::{
    validate_schedule, ItemKind, Priority, ResourceKind, ResourceRequirement, ScheduleItem,
};
use crate::stats::{mean, resource_match, time_of_day_suitability};

/// Relative weights of the slot score terms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub resource_match: f64,
    pub time_of_day: f64,
    pub calendar_fit: f64,
    pub stability: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        ScoringWeights {
            resource_match: 0.4,
            time_of_day: 0.3,
            calendar_fit: 0.2,
            stability: 0.1,
        }
    }
}

impl ScoringWeights {
    pub fn total(&self) -> f64 {
        self.resource_match + self.time_of_day + self.calendar_fit + self.stability
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// First hour of the day an item may start
    pub allowed_start_hour: u32,

    /// Hour of the day by which an item must have ended
    pub allowed_end_hour: u32,

    /// Candidate slots considered per item
    pub max_slots: usize,

    /// Slot evaluations allowed across a whole pass
    pub max_iterations: usize,

    pub weights: ScoringWeights,

    /// Daily drain above which a recovery block is added
    pub high_drain_threshold: f64,

    pub recovery_min_minutes: i64,

    pub recovery_max_minutes: i64,

    /// Recovery minutes per point of daily drain
    pub recovery_minutes_per_drain: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            allowed_start_hour: 8,
            allowed_end_hour: 20,
            max_slots: 7 * 24,
            max_iterations: 5000,
            weights: ScoringWeights::default(),
            high_drain_threshold: 150.0,
            recovery_min_minutes: 45,
            recovery_max_minutes: 120,
            recovery_minutes_per_drain: 0.25,
        }
    }
}

/// Supplies forecasts to an optimization pass
pub trait ForecastSource {
    fn forecast(&self, kind: ResourceKind, horizon_hours: u32) -> Result<Forecast, ForecastError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStatus {
    Optimized,
    /// No forecast could be produced; the schedule is returned unchanged
    InsufficientData,
    /// Cancelled mid-pass; the schedule is returned unchanged
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnscheduledReason {
    OutsideAllowedHours,
    InsufficientResources,
    NoFreeSlot,
    IterationCapReached,
}

impl fmt::Display for UnscheduledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UnscheduledReason::OutsideAllowedHours => "no slot within allowed hours",
            UnscheduledReason::InsufficientResources => "no slot with enough predicted capacity",
            UnscheduledReason::NoFreeSlot => "no free slot",
            UnscheduledReason::IterationCapReached => "search limit reached",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSuggestion {
    pub start: DateTime<Utc>,
    pub score: f64,
    pub resource_match: f64,
    /// Predicted level per kind at the slot
    pub predicted: BTreeMap<ResourceKind, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleChange {
    pub item_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub score: f64,
    /// Conflict that made the item a candidate
    pub trigger: ConflictKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnscheduledItem {
    pub item_id: String,
    pub reason: UnscheduledReason,
    /// Best slot when the conflict filters are relaxed
    pub alternative: Option<SlotSuggestion>,
}

/// Suggested widening of a tight gap; neither item is moved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferHint {
    pub before_item_id: String,
    pub after_item_id: String,
    pub gap_minutes: i64,
    pub suggested_extension_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub message: String,
    pub related_item: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationMetrics {
    pub items_total: usize,
    pub rescheduled: usize,
    pub unscheduled: usize,
    pub recovery_blocks_added: usize,
    pub avg_match_before: f64,
    pub avg_match_after: f64,
    /// Mean share (percent) of energy requirement covered by the forecast
    pub energy_alignment_before: f64,
    pub energy_alignment_after: f64,
    pub energy_alignment_improvement: f64,
    pub conflicts_before: usize,
    pub conflicts_after: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub status: OptimizationStatus,
    pub revised_schedule: Vec<ScheduleItem>,
    /// Conflicts of the input schedule
    pub conflicts: Vec<Conflict>,
    /// Conflicts left in the revised schedule
    pub remaining_conflicts: Vec<Conflict>,
    pub changes: Vec<ScheduleChange>,
    pub unscheduled: Vec<UnscheduledItem>,
    pub buffer_hints: Vec<BufferHint>,
    pub recovery_blocks: Vec<ScheduleItem>,
    pub metrics: OptimizationMetrics,
    pub recommendations: Vec<Recommendation>,
}

impl OptimizationResult {
    fn unchanged(status: OptimizationStatus, items: Vec<ScheduleItem>) -> Self {
        OptimizationResult {
            status,
            metrics: OptimizationMetrics {
                items_total: items.len(),
                ..OptimizationMetrics::default()
            },
            revised_schedule: items,
            conflicts: Vec::new(),
            remaining_conflicts: Vec::new(),
            changes: Vec::new(),
            unscheduled: Vec::new(),
            buffer_hints: Vec::new(),
            recovery_blocks: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

/// Forecasts available to one pass, with slot lookup helpers
struct Outlook<'a> {
    forecasts: &'a [Forecast],
    slots: Vec<DateTime<Utc>>,
    horizon_hours: u32,
    tolerance: Duration,
}

impl Outlook<'_> {
    fn predicted(&self, kind: ResourceKind, at: DateTime<Utc>) -> Option<f64> {
        self.forecasts
            .iter()
            .find(|f| f.kind == kind)
            .and_then(|f| f.point_near(at, self.tolerance))
            .map(|p| p.predicted_level)
    }

    fn predicted_all(&self, at: DateTime<Utc>) -> BTreeMap<ResourceKind, f64> {
        ResourceKind::ALL
            .iter()
            .filter_map(|kind| self.predicted(*kind, at).map(|level| (*kind, level)))
            .collect()
    }

    /// Mean match over required kinds with a prediction, `None` if none apply
    fn match_at(&self, requirement: &ResourceRequirement, at: DateTime<Utc>) -> Option<f64> {
        if requirement.is_zero() {
            return None;
        }
        let matches: Vec<f64> = ResourceKind::ALL
            .iter()
            .filter(|kind| requirement.get(**kind) > 0.0)
            .filter_map(|kind| {
                self.predicted(*kind, at)
                    .map(|p| resource_match(p, requirement.get(*kind)))
            })
            .collect();
        mean(&matches)
    }

    fn covers(&self, requirement: &ResourceRequirement, at: DateTime<Utc>) -> bool {
        ResourceKind::ALL.iter().all(|kind| {
            let required = requirement.get(*kind);
            required <= 0.0
                || self
                    .predicted(*kind, at)
                    .map_or(true, |predicted| predicted >= required)
        })
    }
}

enum SearchOutcome {
    Placed(SlotSuggestion),
    Unplaced(UnscheduledReason),
}

pub struct ScheduleOptimizer {
    config: OptimizerConfig,
    detector: ConflictDetector,
}

impl ScheduleOptimizer {
    pub fn new(config: OptimizerConfig, detector: ConflictDetector) -> Self {
        ScheduleOptimizer { config, detector }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    pub fn optimize(
        &self,
        source: &dyn ForecastSource,
        schedule: &[ScheduleItem],
        horizon_hours: u32,
    ) -> Result<OptimizationResult, EngineError> {
        self.optimize_with_cancel(source, schedule, horizon_hours, &CancellationToken::new())
    }

    /// Optimize, checking `cancel` between candidate evaluations
    pub fn optimize_with_cancel(
        &self,
        source: &dyn ForecastSource,
        schedule: &[ScheduleItem],
        horizon_hours: u32,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult, EngineError> {
        let items = validate_schedule(schedule)?;

        if cancel.is_cancelled() {
            return Ok(self.cancelled(items));
        }

        let mut forecasts = Vec::with_capacity(ResourceKind::ALL.len());
        for kind in ResourceKind::ALL {
            match source.forecast(kind, horizon_hours) {
                Ok(forecast) => forecasts.push(forecast),
                Err(e @ ForecastError::InsufficientHistory { .. }) => {
                    warn!(kind = %kind, error = %e, "No forecast, resource excluded from optimization")
                }
                Err(e) => return Err(e.into()),
            }
        }
        if forecasts.is_empty() {
            return Ok(self.insufficient_data(items));
        }

        let outlook = Outlook {
            slots: forecasts[0]
                .points
                .iter()
                .map(|p| p.time)
                .take(self.config.max_slots)
                .collect(),
            forecasts: &forecasts,
            horizon_hours,
            tolerance: Duration::minutes(self.detector.config().forecast_tolerance_minutes),
        };

        let conflicts = self.detector.detect(&items, &forecasts);
        let candidates = self.select_candidates(&items, &conflicts);
        debug!(
            conflicts = conflicts.len(),
            candidates = candidates.len(),
            "Rescheduling candidates selected"
        );

        let mut working = items.clone();
        let mut changes = Vec::new();
        let mut unscheduled = Vec::new();
        let mut iterations = 0usize;

        for (item_id, trigger) in candidates {
            if cancel.is_cancelled() {
                info!(
                    evaluated = changes.len() + unscheduled.len(),
                    "Optimization cancelled, returning original schedule"
                );
                return Ok(self.cancelled(items));
            }

            let Some(index) = working.iter().position(|i| i.id == item_id) else {
                continue;
            };
            let item = working[index].clone();

            match self.search(&outlook, &item, &working, &mut iterations) {
                SearchOutcome::Placed(slot) => {
                    debug!(item = %item.id, from = %item.start, to = %slot.start, score = slot.score, "Item rescheduled");
                    changes.push(ScheduleChange {
                        item_id: item.id.clone(),
                        from: item.start,
                        to: slot.start,
                        score: slot.score,
                        trigger,
                    });
                    working[index].reschedule(slot.start);
                }
                SearchOutcome::Unplaced(reason) => {
                    debug!(item = %item.id, reason = %reason, "Item left unscheduled");
                    unscheduled.push(UnscheduledItem {
                        item_id: item.id.clone(),
                        reason,
                        alternative: self.alternative(&outlook, &item, &working, &mut iterations),
                    });
                }
            }
        }

        let buffer_hints = self.buffer_hints(&working);
        let (recovery_blocks, crowded_days) = self.plan_recovery(&working)?;
        working.extend(recovery_blocks.iter().cloned());
        working.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));

        let remaining_conflicts = self.detector.detect(&working, &forecasts);

        let (avg_match_before, energy_alignment_before) = alignment(&outlook, &items);
        let (avg_match_after, energy_alignment_after) = alignment(&outlook, &working);
        let metrics = OptimizationMetrics {
            items_total: items.len(),
            rescheduled: changes.len(),
            unscheduled: unscheduled.len(),
            recovery_blocks_added: recovery_blocks.len(),
            avg_match_before,
            avg_match_after,
            energy_alignment_before,
            energy_alignment_after,
            energy_alignment_improvement: energy_alignment_after - energy_alignment_before,
            conflicts_before: conflicts.len(),
            conflicts_after: remaining_conflicts.len(),
        };

        let recommendations = recommend(
            &items,
            &changes,
            &unscheduled,
            &buffer_hints,
            &recovery_blocks,
            &crowded_days,
        );

        info!(
            items = metrics.items_total,
            rescheduled = metrics.rescheduled,
            unscheduled = metrics.unscheduled,
            recovery_blocks = metrics.recovery_blocks_added,
            conflicts_before = metrics.conflicts_before,
            conflicts_after = metrics.conflicts_after,
            "Optimization pass complete"
        );

        Ok(OptimizationResult {
            status: OptimizationStatus::Optimized,
            revised_schedule: working,
            conflicts,
            remaining_conflicts,
            changes,
            unscheduled,
            buffer_hints,
            recovery_blocks,
            metrics,
            recommendations,
        })
    }

    fn insufficient_data(&self, items: Vec<ScheduleItem>) -> OptimizationResult {
        warn!(items = items.len(), "No forecast available, schedule returned unchanged");
        let mut result = OptimizationResult::unchanged(OptimizationStatus::InsufficientData, items);
        result.recommendations.push(Recommendation {
            priority: Priority::Low,
            message: "Insufficient data to optimize this schedule yet. Keep logging check-ins."
                .to_string(),
            related_item: None,
        });
        result
    }

    fn cancelled(&self, items: Vec<ScheduleItem>) -> OptimizationResult {
        OptimizationResult::unchanged(OptimizationStatus::Cancelled, items)
    }

    /// Items to move, highest priority first, each paired with its trigger
    fn select_candidates(
        &self,
        items: &[ScheduleItem],
        conflicts: &[Conflict],
    ) -> Vec<(String, ConflictKind)> {
        let lookup: BTreeMap<&str, &ScheduleItem> =
            items.iter().map(|i| (i.id.as_str(), i)).collect();
        let movable = |id: &str| {
            lookup
                .get(id)
                .map_or(false, |i| !i.fixed && !i.is_recovery())
        };

        let mut picked: Vec<(String, ConflictKind)> = Vec::new();
        let mut seen = HashSet::new();
        let mut pick = |id: &str, trigger: ConflictKind| {
            if seen.insert(id.to_string()) {
                picked.push((id.to_string(), trigger));
            }
        };

        for conflict in conflicts.iter().filter(|c| c.severity.is_actionable()) {
            match conflict.kind {
                ConflictKind::ResourceDeficit => {
                    for id in conflict.subject_item_ids.iter().filter(|id| movable(id)) {
                        pick(id, conflict.kind);
                    }
                }
                ConflictKind::BufferViolation => {
                    let [first, second] = conflict.subject_item_ids.as_slice() else {
                        continue;
                    };
                    let (Some(a), Some(b)) = (lookup.get(first.as_str()), lookup.get(second.as_str()))
                    else {
                        continue;
                    };
                    // Lower priority moves, then the cheaper one to displace,
                    // then the later item
                    let first_moves = a
                        .priority
                        .cmp(&b.priority)
                        .then(a.displacement_cost().cmp(&b.displacement_cost()))
                        .is_lt();
                    let (preferred, fallback) = if first_moves {
                        (first, second)
                    } else {
                        (second, first)
                    };
                    if movable(preferred) {
                        pick(preferred, conflict.kind);
                    } else if movable(fallback) {
                        pick(fallback, conflict.kind);
                    }
                }
                ConflictKind::DailyOverload => {
                    let mut day: Vec<&ScheduleItem> = conflict
                        .subject_item_ids
                        .iter()
                        .filter(|id| movable(id))
                        .filter_map(|id| lookup.get(id.as_str()).copied())
                        .collect();
                    day.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.start.cmp(&a.start)));
                    let excess = conflict
                        .subject_item_ids
                        .len()
                        .saturating_sub(self.detector.config().daily_max_items)
                        .max(1);
                    for item in day.into_iter().take(excess) {
                        pick(&item.id, conflict.kind);
                    }
                }
            }
        }

        picked.sort_by(|(a, _), (b, _)| {
            let (a, b) = (lookup[a.as_str()], lookup[b.as_str()]);
            b.priority
                .cmp(&a.priority)
                .then(a.start.cmp(&b.start))
                .then(a.id.cmp(&b.id))
        });
        picked
    }

    fn within_allowed_hours(&self, item: &ScheduleItem, start: DateTime<Utc>) -> bool {
        if item.ignore_allowed_hours {
            return true;
        }
        let window_end =
            day_start(start.date_naive()) + Duration::hours(self.config.allowed_end_hour as i64);
        start.hour() >= self.config.allowed_start_hour
            && start + Duration::minutes(item.duration_minutes) <= window_end
    }

    fn search(
        &self,
        outlook: &Outlook<'_>,
        item: &ScheduleItem,
        working: &[ScheduleItem],
        iterations: &mut usize,
    ) -> SearchOutcome {
        let daily_max = self.detector.config().daily_max_items;
        let (mut past_hours, mut past_overlap, mut past_resources) = (0usize, 0usize, 0usize);
        let mut best: Option<SlotSuggestion> = None;
        let mut capped = false;

        for &slot in outlook.slots.iter().filter(|s| **s != item.start) {
            if *iterations >= self.config.max_iterations {
                capped = true;
                break;
            }
            *iterations += 1;

            if !self.within_allowed_hours(item, slot) {
                continue;
            }
            past_hours += 1;

            let slot_end = slot + Duration::minutes(item.duration_minutes);
            if working
                .iter()
                .any(|o| o.id != item.id && o.overlaps(slot, slot_end))
            {
                continue;
            }
            past_overlap += 1;

            if !outlook.covers(&item.requirement, slot) {
                continue;
            }
            past_resources += 1;

            let same_day = working
                .iter()
                .filter(|o| o.id != item.id && !o.is_recovery() && o.date() == slot.date_naive())
                .count();
            if same_day >= daily_max {
                continue;
            }

            let suggestion = self.score(outlook, item, slot, working);
            if best.as_ref().map_or(true, |b| suggestion.score > b.score) {
                best = Some(suggestion);
            }
        }

        match best {
            Some(slot) => SearchOutcome::Placed(slot),
            None if capped => {
                warn!(item = %item.id, cap = self.config.max_iterations, "Slot search iteration cap reached");
                SearchOutcome::Unplaced(UnscheduledReason::IterationCapReached)
            }
            None if past_hours == 0 => SearchOutcome::Unplaced(UnscheduledReason::OutsideAllowedHours),
            None if past_overlap == 0 => SearchOutcome::Unplaced(UnscheduledReason::NoFreeSlot),
            None if past_resources == 0 => {
                SearchOutcome::Unplaced(UnscheduledReason::InsufficientResources)
            }
            None => SearchOutcome::Unplaced(UnscheduledReason::NoFreeSlot),
        }
    }

    /// Best slot ignoring overlap, capacity and daily limits. Allowed hours
    /// are kept when any slot satisfies them. Stops at the iteration cap.
    fn alternative(
        &self,
        outlook: &Outlook<'_>,
        item: &ScheduleItem,
        working: &[ScheduleItem],
        iterations: &mut usize,
    ) -> Option<SlotSuggestion> {
        let cap = self.config.max_iterations;
        let mut best_of = |slots: &mut dyn Iterator<Item = DateTime<Utc>>| {
            let mut best: Option<SlotSuggestion> = None;
            for slot in slots {
                if *iterations >= cap {
                    debug!(item = %item.id, cap, "Iteration cap reached while suggesting alternative");
                    break;
                }
                *iterations += 1;
                let suggestion = self.score(outlook, item, slot, working);
                if best.as_ref().map_or(true, |b| suggestion.score > b.score) {
                    best = Some(suggestion);
                }
            }
            best
        };

        let candidates = || outlook.slots.iter().copied().filter(|s| *s != item.start);
        let within_hours = best_of(&mut candidates().filter(|s| self.within_allowed_hours(item, *s)));
        if within_hours.is_some() {
            return within_hours;
        }
        best_of(&mut candidates())
    }

    fn score(
        &self,
        outlook: &Outlook<'_>,
        item: &ScheduleItem,
        slot: DateTime<Utc>,
        working: &[ScheduleItem],
    ) -> SlotSuggestion {
        let weights = &self.config.weights;
        let match_score = outlook.match_at(&item.requirement, slot).unwrap_or(1.0);
        let time_of_day = time_of_day_suitability(item.category, slot.hour());
        let calendar_fit = self.calendar_fit(item, slot, working);

        let original = item.original_start.unwrap_or(item.start);
        let moved_hours = (slot - original).num_minutes().abs() as f64 / 60.0;
        let stability = 1.0 - (moved_hours / outlook.horizon_hours.max(1) as f64).min(1.0);

        let total = weights.total();
        let score = if total > 0.0 {
            (weights.resource_match * match_score
                + weights.time_of_day * time_of_day
                + weights.calendar_fit * calendar_fit
                + weights.stability * stability)
                / total
        } else {
            0.0
        };

        SlotSuggestion {
            start: slot,
            score,
            resource_match: match_score,
            predicted: outlook.predicted_all(slot),
        }
    }

    fn calendar_fit(&self, item: &ScheduleItem, slot: DateTime<Utc>, working: &[ScheduleItem]) -> f64 {
        let buffer = Duration::minutes(self.detector.config().min_buffer_minutes);
        let slot_end = slot + Duration::minutes(item.duration_minutes);
        let crowded = working
            .iter()
            .filter(|o| o.id != item.id && o.needs_buffer())
            .any(|o| o.overlaps(slot - buffer, slot_end + buffer));

        let mut fit = if crowded { 0.5 } else { 1.0 };
        if item.category.is_work() && matches!(slot.weekday(), Weekday::Sat | Weekday::Sun) {
            fit *= 0.8;
        }
        fit
    }

    fn buffer_hints(&self, items: &[ScheduleItem]) -> Vec<BufferHint> {
        let buffer = self.detector.config().min_buffer_minutes;
        adjacent_pairs(items)
            .into_iter()
            .filter_map(|(before, after)| {
                let gap = (after.start - before.end()).num_minutes();
                (gap < buffer).then(|| BufferHint {
                    before_item_id: before.id.clone(),
                    after_item_id: after.id.clone(),
                    gap_minutes: gap,
                    suggested_extension_minutes: buffer - gap,
                })
            })
            .collect()
    }

    /// Recovery blocks for heavy days, plus heavy days with no room for one
    fn plan_recovery(
        &self,
        working: &[ScheduleItem],
    ) -> Result<(Vec<ScheduleItem>, Vec<NaiveDate>), ScheduleError> {
        let mut blocks = Vec::new();
        let mut crowded = Vec::new();
        let taken: HashSet<&str> = working.iter().map(|i| i.id.as_str()).collect();

        for (date, day_items) in items_by_day(working) {
            let drain: f64 = day_items.iter().map(|i| i.drain()).sum();
            if drain <= self.config.high_drain_threshold {
                continue;
            }
            if working.iter().any(|i| i.is_recovery() && i.date() == date) {
                continue;
            }

            let window_start = day_start(date) + Duration::hours(self.config.allowed_start_hour as i64);
            let window_end = day_start(date) + Duration::hours(self.config.allowed_end_hour as i64);
            let Some((gap_start, gap_end)) = largest_gap(working, window_start, window_end)
                .filter(|(s, e)| (*e - *s).num_minutes() >= self.config.recovery_min_minutes)
            else {
                crowded.push(date);
                continue;
            };

            let sized = (drain * self.config.recovery_minutes_per_drain).round() as i64;
            let minutes = sized
                .clamp(self.config.recovery_min_minutes, self.config.recovery_max_minutes)
                .min((gap_end - gap_start).num_minutes());

            let mut id = format!("recovery-{}", date);
            let mut suffix = 2;
            while taken.contains(id.as_str()) {
                id = format!("recovery-{}-{}", date, suffix);
                suffix += 1;
            }

            let block = ScheduleItem::new(
                id,
                ItemKind::RecoveryBlock,
                gap_start,
                minutes,
                ResourceRequirement::default(),
            )?
            .with_title("Recovery block");

            debug!(date = %date, drain, minutes, start = %gap_start, "Recovery block planned");
            blocks.push(block);
        }

        Ok((blocks, crowded))
    }
}

fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Largest free interval inside the window, earliest on ties
fn largest_gap(
    items: &[ScheduleItem],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let mut busy: Vec<(DateTime<Utc>, DateTime<Utc>)> = items
        .iter()
        .filter(|i| i.overlaps(window_start, window_end))
        .map(|i| (i.start, i.end()))
        .collect();
    busy.sort();

    let mut best: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    let mut consider = |start: DateTime<Utc>, end: DateTime<Utc>| {
        if end > start && best.map_or(true, |(s, e)| end - start > e - s) {
            best = Some((start, end));
        }
    };

    let mut cursor = window_start;
    for (start, end) in busy {
        if start > cursor {
            consider(cursor, start.min(window_end));
        }
        cursor = cursor.max(end);
        if cursor >= window_end {
            break;
        }
    }
    if cursor < window_end {
        consider(cursor, window_end);
    }
    best
}

/// Mean resource match and mean energy coverage (percent) of a schedule
fn alignment(outlook: &Outlook<'_>, items: &[ScheduleItem]) -> (f64, f64) {
    let active: Vec<&ScheduleItem> = items.iter().filter(|i| !i.is_recovery()).collect();

    let matches: Vec<f64> = active
        .iter()
        .filter_map(|i| outlook.match_at(&i.requirement, i.start))
        .collect();

    let coverage: Vec<f64> = active
        .iter()
        .filter(|i| i.requirement.energy > 0.0)
        .filter_map(|i| {
            outlook
                .predicted(ResourceKind::Energy, i.start)
                .map(|p| (p / i.requirement.energy).min(1.0) * 100.0)
        })
        .collect();

    (mean(&matches).unwrap_or(0.0), mean(&coverage).unwrap_or(0.0))
}

fn recommend(
    items: &[ScheduleItem],
    changes: &[ScheduleChange],
    unscheduled: &[UnscheduledItem],
    buffer_hints: &[BufferHint],
    recovery_blocks: &[ScheduleItem],
    crowded_days: &[NaiveDate],
) -> Vec<Recommendation> {
    let title = |id: &str| {
        items
            .iter()
            .find(|i| i.id == id)
            .filter(|i| !i.title.is_empty())
            .map(|i| i.title.clone())
            .unwrap_or_else(|| id.to_string())
    };
    let mut recommendations = Vec::new();

    for u in unscheduled {
        let suggestion = match &u.alternative {
            Some(alt) => format!("; closest option is {}", alt.start.format("%a %d %b %H:%M")),
            None => String::new(),
        };
        recommendations.push(Recommendation {
            priority: Priority::High,
            message: format!("Could not move '{}': {}{}", title(&u.item_id), u.reason, suggestion),
            related_item: Some(u.item_id.clone()),
        });
    }

    for change in changes {
        recommendations.push(Recommendation {
            priority: Priority::Medium,
            message: format!(
                "Move '{}' from {} to {} to resolve a {}",
                title(&change.item_id),
                change.from.format("%a %H:%M"),
                change.to.format("%a %H:%M"),
                change.trigger
            ),
            related_item: Some(change.item_id.clone()),
        });
    }

    for block in recovery_blocks {
        recommendations.push(Recommendation {
            priority: Priority::Medium,
            message: format!(
                "Protect {} minutes for recovery on {} at {}",
                block.duration_minutes,
                block.start.format("%a %d %b"),
                block.start.format("%H:%M")
            ),
            related_item: Some(block.id.clone()),
        });
    }

    for date in crowded_days {
        recommendations.push(Recommendation {
            priority: Priority::Medium,
            message: format!("{} is draining with no room for a recovery break", date),
            related_item: None,
        });
    }

    for hint in buffer_hints {
        recommendations.push(Recommendation {
            priority: Priority::Low,
            message: format!(
                "Leave {} more minutes between '{}' and '{}'",
                hint.suggested_extension_minutes,
                title(&hint.before_item_id),
                title(&hint.after_item_id)
            ),
            related_item: Some(hint.after_item_id.clone()),
        });
    }

    if recommendations.is_empty() {
        recommendations.push(Recommendation {
            priority: Priority::Low,
            message: "Schedule already fits the forecast".to_string(),
            related_item: None,
        });
    }

    recommendations
}
