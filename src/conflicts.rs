//! Schedule conflict detection against resource forecasts
//!
//! Three independent scans run over a validated schedule:
//!
//! - resource deficit: an item requires more of a resource than the forecast
//!   predicts at its start
//! - buffer violation: two chronologically adjacent items leave less than the
//!   minimum idle gap between them
//! - daily overload: a calendar day holds too many items or more aggregate
//!   requirement than that day's forecast can carry. Social load grows with
//!   the attendee count of large meetings.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

use crate::forecast::Forecast;
use crate::models::{ResourceKind, ScheduleItem};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Minimum idle gap between adjacent items
    pub min_buffer_minutes: i64,

    /// Items per day above which the day is overloaded
    pub daily_max_items: usize,

    /// Aggregate requirement per kind, as a multiple of the day's average
    /// forecast level, above which the day is overloaded
    pub daily_load_fraction: f64,

    /// Deficit magnitude above which severity is high
    pub deficit_high_threshold: f64,

    /// Deficit magnitude above which severity is medium
    pub deficit_medium_threshold: f64,

    /// Distance tolerated between an item start and a forecast point
    pub forecast_tolerance_minutes: i64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        ConflictConfig {
            min_buffer_minutes: 15,
            daily_max_items: 8,
            daily_load_fraction: 1.5,
            deficit_high_threshold: 30.0,
            deficit_medium_threshold: 15.0,
            forecast_tolerance_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    ResourceDeficit,
    BufferViolation,
    DailyOverload,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictKind::ResourceDeficit => "resource deficit",
            ConflictKind::BufferViolation => "buffer violation",
            ConflictKind::DailyOverload => "daily overload",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical conflicts make items eligible for rescheduling
    pub fn is_actionable(&self) -> bool {
        *self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,

    /// Items involved, in chronological order
    pub subject_item_ids: Vec<String>,

    pub severity: Severity,

    /// Requirement points short for deficits, minutes short for buffer
    /// violations, items over the limit (or requirement points over the
    /// load threshold) for daily overloads
    pub magnitude: f64,

    pub resource: Option<ResourceKind>,

    pub date: Option<NaiveDate>,

    /// Start of the earliest subject item
    pub starts_at: DateTime<Utc>,

    pub message: String,
}

impl Conflict {
    pub fn involves(&self, item_id: &str) -> bool {
        self.subject_item_ids.iter().any(|id| id == item_id)
    }
}

pub struct ConflictDetector {
    config: ConflictConfig,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        ConflictDetector { config }
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    /// Detect every conflict in `items` against the available forecasts.
    /// Kinds without a forecast are skipped by the resource checks.
    pub fn detect(&self, items: &[ScheduleItem], forecasts: &[Forecast]) -> Vec<Conflict> {
        let mut conflicts = self.resource_deficits(items, forecasts);
        conflicts.extend(self.buffer_violations(items));
        conflicts.extend(self.daily_overloads(items, forecasts));

        conflicts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.starts_at.cmp(&b.starts_at))
        });

        debug!(
            items = items.len(),
            conflicts = conflicts.len(),
            "Conflict scan complete"
        );
        conflicts
    }

    fn resource_deficits(&self, items: &[ScheduleItem], forecasts: &[Forecast]) -> Vec<Conflict> {
        let tolerance = Duration::minutes(self.config.forecast_tolerance_minutes);
        let mut conflicts = Vec::new();

        for item in items.iter().filter(|i| !i.is_recovery()) {
            for forecast in forecasts {
                let required = item.requirement.get(forecast.kind);
                if required <= 0.0 {
                    continue;
                }
                let Some(point) = forecast.point_near(item.start, tolerance) else {
                    continue;
                };
                if point.predicted_level >= required {
                    continue;
                }

                let magnitude = required - point.predicted_level;
                conflicts.push(Conflict {
                    kind: ConflictKind::ResourceDeficit,
                    subject_item_ids: vec![item.id.clone()],
                    severity: self.deficit_severity(magnitude),
                    magnitude,
                    resource: Some(forecast.kind),
                    date: Some(item.date()),
                    starts_at: item.start,
                    message: format!(
                        "'{}' needs {:.0} {} but about {:.0} is expected at {}",
                        display_name(item),
                        required,
                        forecast.kind,
                        point.predicted_level,
                        item.start.format("%a %H:%M")
                    ),
                });
            }
        }

        conflicts
    }

    fn deficit_severity(&self, magnitude: f64) -> Severity {
        if magnitude > self.config.deficit_high_threshold {
            Severity::High
        } else if magnitude > self.config.deficit_medium_threshold {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    fn buffer_violations(&self, items: &[ScheduleItem]) -> Vec<Conflict> {
        let buffer = self.config.min_buffer_minutes;
        let mut conflicts = Vec::new();

        for (previous, next) in adjacent_pairs(items) {
            let gap = (next.start - previous.end()).num_minutes();
            if gap >= buffer {
                continue;
            }

            let severity = if gap < 0 {
                Severity::Critical
            } else if gap == 0 {
                Severity::High
            } else if (gap as f64) < buffer as f64 / 2.0 {
                Severity::Medium
            } else {
                Severity::Low
            };

            let message = if gap < 0 {
                format!(
                    "'{}' overlaps '{}' by {} minutes",
                    display_name(previous),
                    display_name(next),
                    -gap
                )
            } else {
                format!(
                    "Only {} minutes between '{}' and '{}' (minimum {})",
                    gap,
                    display_name(previous),
                    display_name(next),
                    buffer
                )
            };

            conflicts.push(Conflict {
                kind: ConflictKind::BufferViolation,
                subject_item_ids: vec![previous.id.clone(), next.id.clone()],
                severity,
                magnitude: (buffer - gap) as f64,
                resource: None,
                date: Some(next.date()),
                starts_at: previous.start,
                message,
            });
        }

        conflicts
    }

    fn daily_overloads(&self, items: &[ScheduleItem], forecasts: &[Forecast]) -> Vec<Conflict> {
        let max_items = self.config.daily_max_items;
        let fraction = self.config.daily_load_fraction;
        let mut conflicts = Vec::new();

        for (date, day_items) in items_by_day(items) {
            let count = day_items.len();
            let count_exceeded = count > max_items;

            // Worst load ratio across kinds: (kind, total requirement, day average)
            let mut worst_load: Option<(ResourceKind, f64, f64)> = None;
            for forecast in forecasts {
                let Some(average) = forecast.average_level_on(date).filter(|a| *a > 0.0) else {
                    continue;
                };
                let total: f64 = day_items
                    .iter()
                    .map(|i| i.load(forecast.kind))
                    .sum();
                let ratio = total / average;
                if worst_load.map_or(true, |(_, t, a)| ratio > t / a) {
                    worst_load = Some((forecast.kind, total, average));
                }
            }
            let load_exceeded = worst_load
                .map(|(_, total, average)| total > fraction * average)
                .unwrap_or(false);

            if !count_exceeded && !load_exceeded {
                continue;
            }

            let heavy_count = count as f64 > 1.5 * max_items as f64;
            let heavy_load = worst_load
                .map(|(_, total, average)| total / average > 1.5 * fraction)
                .unwrap_or(false);
            let severity = if heavy_count || heavy_load {
                Severity::High
            } else {
                Severity::Medium
            };

            let (magnitude, resource, message) = match worst_load {
                Some((kind, total, average)) if load_exceeded && !count_exceeded => (
                    total - fraction * average,
                    Some(kind),
                    format!(
                        "{} asks for {:.0} {} against an expected average of {:.0}",
                        date, total, kind, average
                    ),
                ),
                _ => (
                    (count - max_items) as f64,
                    None,
                    format!(
                        "{} has {} items scheduled (maximum {})",
                        date, count, max_items
                    ),
                ),
            };

            conflicts.push(Conflict {
                kind: ConflictKind::DailyOverload,
                subject_item_ids: day_items.iter().map(|i| i.id.clone()).collect(),
                severity,
                magnitude,
                resource,
                date: Some(date),
                starts_at: day_items[0].start,
                message,
            });
        }

        conflicts
    }
}

/// Chronologically adjacent pairs of items that take part in buffer checks
pub(crate) fn adjacent_pairs(items: &[ScheduleItem]) -> Vec<(&ScheduleItem, &ScheduleItem)> {
    let mut ordered: Vec<&ScheduleItem> = items.iter().filter(|i| i.needs_buffer()).collect();
    ordered.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
    ordered.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Non-recovery items grouped by start date, each day in start order
pub(crate) fn items_by_day(items: &[ScheduleItem]) -> BTreeMap<NaiveDate, Vec<&ScheduleItem>> {
    let mut days: BTreeMap<NaiveDate, Vec<&ScheduleItem>> = BTreeMap::new();
    for item in items.iter().filter(|i| !i.is_recovery()) {
        days.entry(item.date()).or_default().push(item);
    }
    for day in days.values_mut() {
        day.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
    }
    days
}

/// Count conflicts by kind, used for reporting
pub fn summarize(conflicts: &[Conflict]) -> HashMap<ConflictKind, usize> {
    let mut summary = HashMap::new();
    for conflict in conflicts {
        *summary.entry(conflict.kind).or_insert(0) += 1;
    }
    summary
}

fn display_name(item: &ScheduleItem) -> &str {
    if item.title.is_empty() {
        &item.id
    } else {
        &item.title
    }
}
