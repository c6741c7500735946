use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::stats::clamp_level;

/// Longest single schedule item accepted at the API boundary
pub const MAX_ITEM_DURATION_MINUTES: i64 = 24 * 60;

/// Depleting/recovering quantities tracked by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Energy,
    Social,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Energy, ResourceKind::Social];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Energy => "energy",
            ResourceKind::Social => "social",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "energy" => Ok(ResourceKind::Energy),
            "social" | "social_capacity" | "social-capacity" => Ok(ResourceKind::Social),
            _ => Err(format!("Invalid resource kind: {}", s)),
        }
    }
}

/// Origin of a recorded sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    /// Entered by the user
    Manual,
    /// Produced by a passive decay timer
    Decay,
    /// Spent on an activity
    Consumption,
    /// Regained through rest or recovery
    Restoration,
    /// Logged by a social interaction tracker
    Interaction,
}

impl std::str::FromStr for SourceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(SourceTag::Manual),
            "decay" => Ok(SourceTag::Decay),
            "consumption" => Ok(SourceTag::Consumption),
            "restoration" => Ok(SourceTag::Restoration),
            "interaction" => Ok(SourceTag::Interaction),
            _ => Err(format!("Invalid source tag: {}", s)),
        }
    }
}

/// Optional context captured alongside a sample
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleContext {
    /// Self-reported mood (0-10)
    #[serde(default)]
    pub mood: Option<f64>,

    /// Self-reported stress (0-10)
    #[serde(default)]
    pub stress: Option<f64>,

    /// Sleep quality of the preceding night (0-10)
    #[serde(default)]
    pub sleep_quality: Option<f64>,
}

/// A single immutable observation of a resource level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub id: Uuid,

    /// When the level was observed
    pub timestamp: DateTime<Utc>,

    pub kind: ResourceKind,

    /// Observed level, always within [0, 100]
    pub level: f64,

    pub source: SourceTag,

    /// Hour of day (0-23) at `timestamp`
    pub hour_of_day: u32,

    /// Day of week at `timestamp` (0 = Monday)
    pub day_of_week: u32,

    pub context: SampleContext,
}

impl ResourceSample {
    /// Build a sample, clamping the level and deriving calendar attributes
    pub(crate) fn new(
        kind: ResourceKind,
        level: f64,
        source: SourceTag,
        context: SampleContext,
        timestamp: DateTime<Utc>,
    ) -> Self {
        ResourceSample {
            id: Uuid::new_v4(),
            timestamp,
            kind,
            level: clamp_level(level),
            source,
            hour_of_day: timestamp.hour(),
            day_of_week: timestamp.weekday().num_days_from_monday(),
            context,
        }
    }
}

/// Weather conditions reported by an external integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeatherCondition {
    Sunny,
    Cloudy,
    Rainy,
    Stormy,
}

/// Planned activity level for the forecast window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Rest,
    Light,
    Moderate,
    Intense,
    SocialGathering,
}

/// External hints supplied to the forecaster. Missing values are neutral.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalFactors {
    #[serde(default)]
    pub weather: Option<WeatherCondition>,

    /// Outdoor temperature in degrees Celsius
    #[serde(default)]
    pub temperature_c: Option<f64>,

    /// Sleep quality (0-10)
    #[serde(default)]
    pub sleep_quality: Option<f64>,

    #[serde(default)]
    pub sleep_hours: Option<f64>,

    /// Stress level (0-10)
    #[serde(default)]
    pub stress_level: Option<f64>,

    #[serde(default)]
    pub scheduled_activity: Option<ActivityLevel>,
}

impl ExternalFactors {
    pub fn is_empty(&self) -> bool {
        *self == ExternalFactors::default()
    }

    /// Additive effect in level points for the given resource
    pub fn effect(&self, kind: ResourceKind) -> f64 {
        let mut effect = 0.0;

        if let Some(quality) = self.sleep_quality.filter(|q| q.is_finite()) {
            let weight = match kind {
                ResourceKind::Energy => 2.5,
                ResourceKind::Social => 1.5,
            };
            effect += (quality.clamp(0.0, 10.0) - 7.0) * weight;
        }

        if let Some(hours) = self.sleep_hours.filter(|h| h.is_finite()) {
            effect += ((hours - 7.5) * 3.0).clamp(-10.0, 10.0);
        }

        if let Some(stress) = self.stress_level.filter(|s| s.is_finite()) {
            let weight = match kind {
                ResourceKind::Energy => 1.5,
                ResourceKind::Social => 2.0,
            };
            effect -= (stress.clamp(0.0, 10.0) - 5.0) * weight;
        }

        if let Some(weather) = self.weather {
            effect += match weather {
                WeatherCondition::Sunny => 3.0,
                WeatherCondition::Cloudy => 0.0,
                WeatherCondition::Rainy => -3.0,
                WeatherCondition::Stormy => -5.0,
            };
        }

        if let Some(temp) = self.temperature_c.filter(|t| t.is_finite()) {
            if !(10.0..=28.0).contains(&temp) {
                effect -= 2.0;
            }
        }

        if let Some(activity) = self.scheduled_activity {
            effect += match (kind, activity) {
                (ResourceKind::Energy, ActivityLevel::Rest) => 5.0,
                (ResourceKind::Energy, ActivityLevel::Light) => 0.0,
                (ResourceKind::Energy, ActivityLevel::Moderate) => -3.0,
                (ResourceKind::Energy, ActivityLevel::Intense) => -8.0,
                (ResourceKind::Energy, ActivityLevel::SocialGathering) => -3.0,
                (ResourceKind::Social, ActivityLevel::Rest) => 3.0,
                (ResourceKind::Social, ActivityLevel::SocialGathering) => -6.0,
                (ResourceKind::Social, _) => 0.0,
            };
        }

        effect
    }
}

/// What a schedule item represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Task,
    Event,
    RecoveryBlock,
}

/// Category used for time-of-day reasoning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCategory {
    Meeting,
    Focus,
    Social,
    Admin,
    Exercise,
    Personal,
    Recovery,
    #[default]
    Other,
}

impl ItemCategory {
    /// Categories that count as work for calendar-fit purposes
    pub fn is_work(&self) -> bool {
        matches!(
            self,
            ItemCategory::Meeting | ItemCategory::Focus | ItemCategory::Admin
        )
    }
}

/// Scheduling priority, ordered from least to most important
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Resource requirement of a schedule item, each value within [0, 100]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub energy: f64,
    pub social: f64,
}

impl ResourceRequirement {
    pub fn new(energy: f64, social: f64) -> Self {
        ResourceRequirement {
            energy: clamp_level(energy),
            social: clamp_level(social),
        }
    }

    pub fn get(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Energy => self.energy,
            ResourceKind::Social => self.social,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.energy <= 0.0 && self.social <= 0.0
    }
}

/// Attendees a meeting can have before social load starts to grow
pub const SMALL_GROUP_SIZE: u32 = 3;

/// Extra share of social load per attendee beyond [`SMALL_GROUP_SIZE`]
pub const ATTENDEE_SOCIAL_FACTOR: f64 = 0.1;

/// A time-boxed task, event, or recovery block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub id: String,

    #[serde(default)]
    pub title: String,

    pub kind: ItemKind,

    pub start: DateTime<Utc>,

    pub duration_minutes: i64,

    #[serde(default)]
    pub requirement: ResourceRequirement,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub category: ItemCategory,

    #[serde(default)]
    pub attendee_count: u32,

    #[serde(default)]
    pub recurring: bool,

    /// Fixed items are never moved by the optimizer
    #[serde(default)]
    pub fixed: bool,

    /// Allow placement outside the configured working hours
    #[serde(default)]
    pub ignore_allowed_hours: bool,

    /// Start time before the first reschedule, kept for audit
    #[serde(default)]
    pub original_start: Option<DateTime<Utc>>,
}

impl ScheduleItem {
    pub fn new(
        id: impl Into<String>,
        kind: ItemKind,
        start: DateTime<Utc>,
        duration_minutes: i64,
        requirement: ResourceRequirement,
    ) -> Result<Self, ScheduleError> {
        let item = ScheduleItem {
            id: id.into(),
            title: String::new(),
            kind,
            start,
            duration_minutes,
            requirement,
            priority: Priority::default(),
            category: if kind == ItemKind::RecoveryBlock {
                ItemCategory::Recovery
            } else {
                ItemCategory::Other
            },
            attendee_count: 0,
            recurring: false,
            fixed: false,
            ignore_allowed_hours: false,
            original_start: None,
        };
        item.validated()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: ItemCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_attendees(mut self, attendee_count: u32) -> Self {
        self.attendee_count = attendee_count;
        self
    }

    pub fn recurring(mut self) -> Self {
        self.recurring = true;
        self
    }

    pub fn fixed(mut self) -> Self {
        self.fixed = true;
        self
    }

    /// Check boundary constraints and clamp requirements into range
    pub fn validated(mut self) -> Result<Self, ScheduleError> {
        if self.id.trim().is_empty() {
            return Err(ScheduleError::InvalidScheduleItem {
                id: self.id,
                reason: "item id must not be empty".to_string(),
            });
        }
        if self.duration_minutes <= 0 || self.duration_minutes > MAX_ITEM_DURATION_MINUTES {
            return Err(ScheduleError::InvalidScheduleItem {
                reason: format!(
                    "duration must be between 1 and {} minutes, got {}",
                    MAX_ITEM_DURATION_MINUTES, self.duration_minutes
                ),
                id: self.id,
            });
        }
        if self.requirement.energy.is_nan() || self.requirement.social.is_nan() {
            return Err(ScheduleError::InvalidScheduleItem {
                id: self.id,
                reason: "resource requirement must be a number".to_string(),
            });
        }
        self.requirement = ResourceRequirement::new(self.requirement.energy, self.requirement.social);
        Ok(self)
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::minutes(self.duration_minutes)
    }

    pub fn date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration_minutes as f64 / 60.0
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end()
    }

    pub fn is_recovery(&self) -> bool {
        self.kind == ItemKind::RecoveryBlock
    }

    /// Items that take part in buffer checks
    pub fn needs_buffer(&self) -> bool {
        !self.is_recovery() && self.category != ItemCategory::Personal
    }

    /// Social requirement scaled up for every attendee beyond
    /// [`SMALL_GROUP_SIZE`], capped at 100
    pub fn social_load(&self) -> f64 {
        let extra = self.attendee_count.saturating_sub(SMALL_GROUP_SIZE) as f64;
        (self.requirement.social * (1.0 + ATTENDEE_SOCIAL_FACTOR * extra)).min(100.0)
    }

    /// Requirement of one kind as counted toward a day's load
    pub fn load(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Energy => self.requirement.energy,
            ResourceKind::Social => self.social_load(),
        }
    }

    /// Resource drain in requirement-hours
    pub fn drain(&self) -> f64 {
        (self.load(ResourceKind::Energy) + self.load(ResourceKind::Social)) / 2.0 * self.duration_hours()
    }

    /// Ordering key for choosing which of two items to move: items that are
    /// cheaper to displace sort first. Non-recurring before recurring, then
    /// fewer attendees.
    pub fn displacement_cost(&self) -> (bool, u32) {
        (self.recurring, self.attendee_count)
    }

    /// Move the item, preserving its id and recording the first original start
    pub(crate) fn reschedule(&mut self, new_start: DateTime<Utc>) {
        if self.original_start.is_none() {
            self.original_start = Some(self.start);
        }
        self.start = new_start;
    }
}

/// Validate every item of a schedule and reject duplicate ids
pub fn validate_schedule(items: &[ScheduleItem]) -> Result<Vec<ScheduleItem>, ScheduleError> {
    let mut seen = std::collections::HashSet::with_capacity(items.len());
    items
        .iter()
        .map(|item| {
            if !seen.insert(item.id.as_str()) {
                return Err(ScheduleError::DuplicateId {
                    id: item.id.clone(),
                });
            }
            item.clone().validated()
        })
        .collect()
}

/// Count pairs of overlapping items
pub fn count_overlaps(items: &[ScheduleItem]) -> usize {
    let mut count = 0;
    for (i, a) in items.iter().enumerate() {
        for b in &items[i + 1..] {
            if a.overlaps(b.start, b.end()) {
                count += 1;
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 23, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_sample_derives_calendar_attributes() {
        let sample = ResourceSample::new(
            ResourceKind::Energy,
            150.0,
            SourceTag::Manual,
            SampleContext::default(),
            at(10, 15),
        );

        assert_eq!(sample.level, 100.0);
        assert_eq!(sample.hour_of_day, 10);
        assert_eq!(sample.day_of_week, 0); // 2024-09-23 is a Monday
    }

    #[test]
    fn test_requirement_clamped() {
        let req = ResourceRequirement::new(-20.0, 140.0);
        assert_eq!(req.energy, 0.0);
        assert_eq!(req.social, 100.0);
        assert!(!req.is_zero());
        assert!(ResourceRequirement::default().is_zero());
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let result = ScheduleItem::new(
            "a",
            ItemKind::Task,
            at(9, 0),
            0,
            ResourceRequirement::default(),
        );
        assert!(matches!(
            result,
            Err(ScheduleError::InvalidScheduleItem { .. })
        ));
    }

    #[test]
    fn test_attendees_scale_social_load() {
        let item = ScheduleItem::new(
            "all-hands",
            ItemKind::Event,
            at(9, 0),
            60,
            ResourceRequirement::new(10.0, 20.0),
        )
        .unwrap();
        assert_eq!(item.load(ResourceKind::Social), 20.0);
        assert_eq!(item.clone().with_attendees(3).social_load(), 20.0);

        let crowded = item.with_attendees(8);
        assert!((crowded.social_load() - 30.0).abs() < 1e-9);
        assert_eq!(crowded.load(ResourceKind::Energy), 10.0);
        assert!((crowded.drain() - 20.0).abs() < 1e-9);
        assert_eq!(crowded.with_attendees(500).social_load(), 100.0);
    }

    #[test]
    fn test_displacement_cost_orders_recurring_last() {
        let base = ScheduleItem::new("a", ItemKind::Event, at(9, 0), 30, ResourceRequirement::default()).unwrap();
        let weekly = base.clone().recurring();
        let crowded = base.clone().with_attendees(6);

        assert!(base.displacement_cost() < crowded.displacement_cost());
        assert!(crowded.displacement_cost() < weekly.displacement_cost());
    }

    #[test]
    fn test_reschedule_keeps_first_original() {
        let mut item = ScheduleItem::new(
            "a",
            ItemKind::Task,
            at(9, 0),
            60,
            ResourceRequirement::new(40.0, 10.0),
        )
        .unwrap();

        item.reschedule(at(11, 0));
        item.reschedule(at(14, 0));

        assert_eq!(item.id, "a");
        assert_eq!(item.start, at(14, 0));
        assert_eq!(item.original_start, Some(at(9, 0)));
    }

    #[test]
    fn test_external_factor_effects() {
        assert_eq!(ExternalFactors::default().effect(ResourceKind::Energy), 0.0);

        let tired = ExternalFactors {
            sleep_hours: Some(4.0),
            stress_level: Some(9.0),
            ..ExternalFactors::default()
        };
        assert!(tired.effect(ResourceKind::Energy) < -10.0);

        let party = ExternalFactors {
            scheduled_activity: Some(ActivityLevel::SocialGathering),
            ..ExternalFactors::default()
        };
        assert_eq!(party.effect(ResourceKind::Social), -6.0);
    }

    #[test]
    fn test_count_overlaps() {
        let req = ResourceRequirement::default();
        let a = ScheduleItem::new("a", ItemKind::Event, at(9, 0), 60, req).unwrap();
        let b = ScheduleItem::new("b", ItemKind::Event, at(9, 30), 60, req).unwrap();
        let c = ScheduleItem::new("c", ItemKind::Event, at(10, 30), 30, req).unwrap();

        assert_eq!(count_overlaps(&[a, b, c]), 1);
    }

    #[test]
    fn test_validate_schedule_rejects_duplicates() {
        let req = ResourceRequirement::default();
        let a = ScheduleItem::new("a", ItemKind::Task, at(9, 0), 30, req).unwrap();
        let b = ScheduleItem::new("a", ItemKind::Task, at(11, 0), 30, req).unwrap();

        assert_eq!(
            validate_schedule(&[a.clone(), b]),
            Err(ScheduleError::DuplicateId { id: "a".to_string() })
        );
        assert_eq!(validate_schedule(&[a]).unwrap().len(), 1);
    }
}
