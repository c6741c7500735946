use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use tracing::warn;

use capacityrs::clock::{Clock, ManualClock, SystemClock};
use capacityrs::conflicts::{summarize, Severity};
use capacityrs::import::{load_factors, load_schedule, SampleCsvImporter};
use capacityrs::logging::{init_logging, LogLevel};
use capacityrs::optimizer::OptimizationStatus;
use capacityrs::{CapacityEngine, EngineConfig, Forecast, ResourceKind};

/// capacityrs - Energy and social capacity forecasting CLI
///
/// Forecasts personal energy and social capacity from check-in history and
/// reshapes calendars around the predicted levels.
#[derive(Parser)]
#[command(name = "capacityrs")]
#[command(version = "0.1.0")]
#[command(about = "Capacity forecasting and schedule optimization", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Evaluate as of this instant (RFC 3339) instead of now
    #[arg(long, value_name = "TIME")]
    at: Option<DateTime<Utc>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forecast one resource from a sample history
    Forecast {
        /// Sample history CSV
        #[arg(long)]
        history: PathBuf,

        /// Resource kind (energy, social)
        #[arg(short, long, default_value = "energy")]
        kind: ResourceKind,

        /// Forecast horizon in hours
        #[arg(long, default_value = "24")]
        hours: u32,

        /// External factor hints (JSON)
        #[arg(short, long)]
        factors: Option<PathBuf>,
    },

    /// List conflicts in a schedule
    Conflicts {
        #[arg(long)]
        history: PathBuf,

        /// Schedule items (JSON array)
        #[arg(short, long)]
        schedule: PathBuf,

        #[arg(long, default_value = "48")]
        hours: u32,
    },

    /// Reschedule conflicting items around predicted capacity
    Optimize {
        #[arg(long)]
        history: PathBuf,

        #[arg(short, long)]
        schedule: PathBuf,

        #[arg(long, default_value = "48")]
        hours: u32,

        /// Write the full result as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage the configuration file
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,

        /// Print the active configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Tabled)]
struct PointRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Level")]
    level: String,
    #[tabled(rename = "Confidence")]
    confidence: String,
    #[tabled(rename = "Spread")]
    spread: String,
}

#[derive(Tabled)]
struct ConflictRow {
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Items")]
    items: String,
    #[tabled(rename = "Details")]
    message: String,
}

#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "Item")]
    item: String,
    #[tabled(rename = "From")]
    from: String,
    #[tabled(rename = "To")]
    to: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Reason")]
    trigger: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // A broken default config file is reported once logging is installed
    let (mut config, config_error) = match &cli.config {
        Some(path) => (EngineConfig::load_from_file(path)?, None),
        None => match EngineConfig::try_load_default() {
            Ok(config) => (config.unwrap_or_default(), None),
            Err(e) => (EngineConfig::default(), Some(e)),
        },
    };
    config.logging.level = LogLevel::from_verbosity(config.logging.level, cli.verbose);
    init_logging(&config.logging)?;

    if let Some(e) = config_error {
        warn!(
            path = %EngineConfig::default_config_path().display(),
            error = %e,
            "Unusable config file, using defaults"
        );
    }

    if cli.verbose > 0 {
        eprintln!(
            "{}",
            format!("Log level: {}", config.logging.level.as_str()).dimmed()
        );
    }

    let clock: Arc<dyn Clock> = match cli.at {
        Some(at) => Arc::new(ManualClock::new(at)),
        None => Arc::new(SystemClock),
    };

    match cli.command {
        Commands::Forecast {
            history,
            kind,
            hours,
            factors,
        } => {
            let mut engine = engine_with_history(config, clock, &history)?;
            let factors = factors.map(load_factors).transpose()?;
            let forecast = engine.forecast(kind, hours, factors.as_ref())?;
            print_forecast(&forecast);
        }

        Commands::Conflicts {
            history,
            schedule,
            hours,
        } => {
            let mut engine = engine_with_history(config, clock, &history)?;
            let items = load_schedule(&schedule)?;
            let conflicts = engine.detect_conflicts(&items, hours)?;

            if conflicts.is_empty() {
                println!("{}", "✓ No conflicts found".green());
                return Ok(());
            }
            let mut counts: Vec<String> = summarize(&conflicts)
                .into_iter()
                .map(|(kind, count)| format!("{} {}", count, kind))
                .collect();
            counts.sort();
            println!(
                "{}",
                format!("{} conflict(s) found: {}", conflicts.len(), counts.join(", "))
                    .yellow()
                    .bold()
            );
            print_conflicts(&conflicts);
        }

        Commands::Optimize {
            history,
            schedule,
            hours,
            output,
        } => {
            let mut engine = engine_with_history(config, clock, &history)?;
            let items = load_schedule(&schedule)?;
            let result = engine.optimize(&items, hours)?;

            match result.status {
                OptimizationStatus::Optimized => {
                    println!("{}", "Schedule optimized".green().bold())
                }
                OptimizationStatus::InsufficientData => println!(
                    "{}",
                    "Not enough history to optimize; schedule unchanged".yellow().bold()
                ),
                OptimizationStatus::Cancelled => {
                    println!("{}", "Optimization cancelled".red().bold())
                }
            }

            if !result.conflicts.is_empty() {
                println!("\n{}", "Conflicts".bold());
                print_conflicts(&result.conflicts);
            }

            if !result.changes.is_empty() {
                let rows: Vec<ChangeRow> = result
                    .changes
                    .iter()
                    .map(|c| ChangeRow {
                        item: c.item_id.clone(),
                        from: c.from.format("%a %H:%M").to_string(),
                        to: c.to.format("%a %H:%M").to_string(),
                        score: format!("{:.2}", c.score),
                        trigger: c.trigger.to_string(),
                    })
                    .collect();
                println!("\n{}", "Moved".bold());
                println!("{}", Table::new(rows).with(Style::rounded()));
            }

            for item in &result.unscheduled {
                let alternative = item
                    .alternative
                    .as_ref()
                    .map(|a| format!(" (best available: {})", a.start.format("%a %H:%M")))
                    .unwrap_or_default();
                println!(
                    "{} {}: {}{}",
                    "✗".red(),
                    item.item_id,
                    item.reason,
                    alternative.dimmed()
                );
            }

            for hint in &result.buffer_hints {
                println!(
                    "{} widen gap between {} and {} by {} min",
                    "•".cyan(),
                    hint.before_item_id,
                    hint.after_item_id,
                    hint.suggested_extension_minutes
                );
            }

            for block in &result.recovery_blocks {
                println!(
                    "{} recovery block {} for {} min",
                    "+".green(),
                    block.start.format("%a %H:%M"),
                    block.duration_minutes
                );
            }

            for rec in &result.recommendations {
                println!("{} {}", "→".blue(), rec.message);
            }

            let m = &result.metrics;
            println!("\n{}", "Summary".bold());
            println!("  Items:            {}", m.items_total);
            println!("  Rescheduled:      {}", m.rescheduled);
            println!("  Unscheduled:      {}", m.unscheduled);
            println!("  Conflicts:        {} → {}", m.conflicts_before, m.conflicts_after);
            println!(
                "  Resource match:   {:.2} → {:.2}",
                m.avg_match_before, m.avg_match_after
            );
            println!(
                "  Energy alignment: {:+.1}%",
                m.energy_alignment_improvement
            );

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&result)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("{}", format!("✓ Result written to {}", path.display()).green());
            }
        }

        Commands::Config { init, show } => {
            if init {
                let path = match &cli.config {
                    Some(path) => {
                        config.save_to_file(path)?;
                        path.clone()
                    }
                    None => config.save_default()?,
                };
                println!("{}", format!("✓ Configuration written to {}", path.display()).green());
            }
            if show || !init {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

fn engine_with_history(
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    history: &Path,
) -> Result<CapacityEngine> {
    let records = SampleCsvImporter::new().import_file(history)?;
    let mut engine = CapacityEngine::new(config, clock);
    engine.import_samples(records)?;
    Ok(engine)
}

fn print_forecast(forecast: &Forecast) {
    let header = format!(
        "{} forecast, {} h, confidence {:.0}%",
        forecast.kind,
        forecast.horizon_hours,
        forecast.confidence * 100.0
    );
    println!("{}", header.cyan().bold());
    if forecast.degraded {
        println!(
            "{}",
            format!(
                "Limited history ({} samples); predictions are rough",
                forecast.history_samples
            )
            .yellow()
        );
    }

    let rows: Vec<PointRow> = forecast
        .points
        .iter()
        .map(|p| PointRow {
            time: p.time.format("%a %H:%M").to_string(),
            level: format!("{:.1}", p.predicted_level),
            confidence: format!("{:.2}", p.confidence),
            spread: format!("{:.1}", p.uncertainty),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));

    let insights = &forecast.insights;
    for period in &insights.peak_periods {
        println!(
            "{} peak {}–{} (avg {:.0})",
            "▲".green(),
            period.start.format("%a %H:%M"),
            period.end.format("%H:%M"),
            period.average_level
        );
    }
    for period in &insights.low_periods {
        println!(
            "{} low {}–{} (avg {:.0})",
            "▼".red(),
            period.start.format("%a %H:%M"),
            period.end.format("%H:%M"),
            period.average_level
        );
    }
    println!("Trend: {:?} ({:+.1})", insights.trend.direction, insights.trend.delta);
    for rec in &insights.recommendations {
        println!("{} {}", "→".blue(), rec);
    }
}

fn print_conflicts(conflicts: &[capacityrs::Conflict]) {
    let rows: Vec<ConflictRow> = conflicts
        .iter()
        .map(|c| {
            let severity = match c.severity {
                Severity::Critical => c.severity.to_string().red().bold().to_string(),
                Severity::High => c.severity.to_string().red().to_string(),
                Severity::Medium => c.severity.to_string().yellow().to_string(),
                Severity::Low => c.severity.to_string().dimmed().to_string(),
            };
            ConflictRow {
                severity,
                kind: c.kind.to_string(),
                items: c.subject_item_ids.join(", "),
                message: c.message.clone(),
            }
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}
