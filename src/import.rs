//! File ingestion for the command-line harness
//!
//! Sample history comes from CSV in one of two layouts:
//!
//! - long: one row per sample with `timestamp`, `kind`, `level` and optional
//!   `source`, `mood`, `stress`, `sleep_quality` columns
//! - wide: one row per check-in with `timestamp` plus `energy` and/or
//!   `social` columns
//!
//! Schedules and external factors are read as JSON.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

use crate::models::{validate_schedule, ExternalFactors, ResourceKind, SampleContext, ScheduleItem, SourceTag};
use crate::resource_state::SampleRecord;

/// CSV sample importer with tolerant column naming
pub struct SampleCsvImporter {
    column_mapping: HashMap<String, String>,
    default_source: SourceTag,
}

impl Default for SampleCsvImporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleCsvImporter {
    pub fn new() -> Self {
        let mut column_mapping = HashMap::new();
        Self::add_mapping(
            &mut column_mapping,
            "timestamp",
            &["timestamp", "time", "datetime", "recorded_at", "date"],
        );
        Self::add_mapping(&mut column_mapping, "kind", &["kind", "resource", "resource_kind", "type"]);
        Self::add_mapping(&mut column_mapping, "level", &["level", "value", "score"]);
        Self::add_mapping(&mut column_mapping, "source", &["source", "source_tag", "origin"]);
        Self::add_mapping(&mut column_mapping, "energy", &["energy", "energy_level"]);
        Self::add_mapping(
            &mut column_mapping,
            "social",
            &["social", "social_capacity", "social_level", "social_battery"],
        );
        Self::add_mapping(&mut column_mapping, "mood", &["mood"]);
        Self::add_mapping(&mut column_mapping, "stress", &["stress", "stress_level"]);
        Self::add_mapping(&mut column_mapping, "sleep_quality", &["sleep_quality", "sleep"]);

        Self {
            column_mapping,
            default_source: SourceTag::Manual,
        }
    }

    pub fn with_default_source(mut self, source: SourceTag) -> Self {
        self.default_source = source;
        self
    }

    fn add_mapping(mapping: &mut HashMap<String, String>, standard: &str, variations: &[&str]) {
        for variation in variations {
            mapping.insert(variation.to_lowercase(), standard.to_string());
        }
    }

    fn normalize_column_name(&self, name: &str) -> String {
        let normalized = name.trim().to_lowercase().replace([' ', '-'], "_");
        self.column_mapping
            .get(&normalized)
            .cloned()
            .unwrap_or(normalized)
    }

    fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
        let value = value.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Ok(dt.with_timezone(&Utc));
        }

        let formats = [
            "%Y-%m-%d %H:%M:%S",
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%d %H:%M",
            "%Y-%m-%dT%H:%M",
        ];
        for format in &formats {
            if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
                return Ok(naive.and_utc());
            }
        }

        if let Ok(seconds) = value.parse::<i64>() {
            if let Some(dt) = DateTime::from_timestamp(seconds, 0) {
                return Ok(dt);
            }
        }

        anyhow::bail!("Unable to parse timestamp: {}", value);
    }

    pub fn import_file<P: AsRef<Path>>(&self, path: P) -> Result<Vec<SampleRecord>> {
        let file = fs::File::open(&path)
            .with_context(|| format!("Failed to open sample file: {}", path.as_ref().display()))?;
        self.import_reader(file)
            .with_context(|| format!("Failed to import samples from {}", path.as_ref().display()))
    }

    /// Parse samples, returning them sorted by timestamp
    pub fn import_reader<R: Read>(&self, reader: R) -> Result<Vec<SampleRecord>> {
        let mut csv = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = csv
            .headers()
            .context("Missing CSV header row")?
            .iter()
            .map(|h| self.normalize_column_name(h))
            .collect();
        let column = |name: &str| headers.iter().position(|h| h == name);

        let timestamp_col = column("timestamp").context("CSV has no timestamp column")?;
        let long_layout = match (column("kind"), column("level")) {
            (Some(kind), Some(level)) => Some((kind, level)),
            _ => None,
        };
        let wide_columns: Vec<(ResourceKind, usize)> = [
            (ResourceKind::Energy, column("energy")),
            (ResourceKind::Social, column("social")),
        ]
        .into_iter()
        .filter_map(|(kind, col)| col.map(|c| (kind, c)))
        .collect();

        if long_layout.is_none() && wide_columns.is_empty() {
            anyhow::bail!("CSV needs either kind/level columns or energy/social columns");
        }

        let source_col = column("source");
        let mood_col = column("mood");
        let stress_col = column("stress");
        let sleep_col = column("sleep_quality");

        let mut records = Vec::new();
        for (row, result) in csv.records().enumerate() {
            let line = row + 2;
            let record = result.with_context(|| format!("Malformed CSV row {}", line))?;

            let timestamp = Self::parse_datetime(field(&record, Some(timestamp_col)).unwrap_or(""))
                .with_context(|| format!("Row {}", line))?;
            let source = match field(&record, source_col) {
                Some(value) => value
                    .parse::<SourceTag>()
                    .map_err(|e| anyhow::anyhow!("Row {}: {}", line, e))?,
                None => self.default_source,
            };
            let context = SampleContext {
                mood: number(&record, mood_col),
                stress: number(&record, stress_col),
                sleep_quality: number(&record, sleep_col),
            };

            if let Some((kind_col, level_col)) = long_layout {
                let kind = field(&record, Some(kind_col))
                    .unwrap_or("")
                    .parse::<ResourceKind>()
                    .map_err(|e| anyhow::anyhow!("Row {}: {}", line, e))?;
                let Some(level) = number(&record, Some(level_col)) else {
                    warn!(row = line, "Skipping row without a numeric level");
                    continue;
                };
                records.push(SampleRecord {
                    timestamp,
                    kind,
                    level,
                    source,
                    context,
                });
            } else {
                for (kind, col) in &wide_columns {
                    if let Some(level) = number(&record, Some(*col)) {
                        records.push(SampleRecord {
                            timestamp,
                            kind: *kind,
                            level,
                            source,
                            context: context.clone(),
                        });
                    }
                }
            }
        }

        records.sort_by_key(|r| r.timestamp);
        debug!(samples = records.len(), "Parsed sample CSV");
        Ok(records)
    }
}

fn field(record: &StringRecord, col: Option<usize>) -> Option<&str> {
    col.and_then(|c| record.get(c)).filter(|v| !v.is_empty())
}

fn number(record: &StringRecord, col: Option<usize>) -> Option<f64> {
    field(record, col)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| !v.is_nan())
}

/// Load and validate a JSON array of schedule items
pub fn load_schedule<P: AsRef<Path>>(path: P) -> Result<Vec<ScheduleItem>> {
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read schedule: {}", path.as_ref().display()))?;
    let items: Vec<ScheduleItem> =
        serde_json::from_str(&content).with_context(|| "Failed to parse schedule JSON")?;
    Ok(validate_schedule(&items)?)
}

pub fn load_factors<P: AsRef<Path>>(path: P) -> Result<ExternalFactors> {
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read factors: {}", path.as_ref().display()))?;
    serde_json::from_str(&content).with_context(|| "Failed to parse external factors JSON")
}
