//! Peak/low period detection and trend summary over a forecast

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::PredictionPoint;

/// Thresholds used when deriving insights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    /// Points at or above this level form peak periods
    pub peak_threshold: f64,

    /// Points at or below this level form low periods
    pub low_threshold: f64,

    /// Runs separated by at most this many hours are merged
    pub merge_gap_hours: f64,

    /// Minimum |last - first| for a rising or falling trend
    pub trend_threshold: f64,

    /// Overall confidence below which more data is requested
    pub low_confidence: f64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        InsightConfig {
            peak_threshold: 75.0,
            low_threshold: 30.0,
            merge_gap_hours: 1.5,
            trend_threshold: 5.0,
            low_confidence: 0.4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Increasing,
    Stable,
    Decreasing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    /// Last point minus first point
    pub delta: f64,
    pub direction: TrendDirection,
}

/// A contiguous stretch of forecast hours above or below a threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    /// Exclusive end: the last included point's hour plus one hour
    pub end: DateTime<Utc>,
    pub average_level: f64,
    /// Highest level for peaks, lowest for lows
    pub extreme_level: f64,
    pub points: usize,
}

impl Period {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastInsights {
    pub peak_periods: Vec<Period>,
    pub low_periods: Vec<Period>,
    pub trend: TrendSummary,
    pub recommendations: Vec<String>,
}

impl ForecastInsights {
    pub fn is_peak(&self, at: DateTime<Utc>) -> bool {
        self.peak_periods.iter().any(|p| p.contains(at))
    }

    pub fn is_low(&self, at: DateTime<Utc>) -> bool {
        self.low_periods.iter().any(|p| p.contains(at))
    }
}

pub fn analyze(
    points: &[PredictionPoint],
    overall_confidence: f64,
    config: &InsightConfig,
) -> ForecastInsights {
    let peak_periods = detect_periods(
        points,
        |level| level >= config.peak_threshold,
        f64::max,
        config.merge_gap_hours,
    );
    let low_periods = detect_periods(
        points,
        |level| level <= config.low_threshold,
        f64::min,
        config.merge_gap_hours,
    );
    let trend = summarize_trend(points, config.trend_threshold);

    let mut recommendations = Vec::new();
    for period in &peak_periods {
        recommendations.push(format!(
            "Schedule demanding work between {} and {} (around {:.0}%)",
            period.start.format("%a %H:%M"),
            period.end.format("%H:%M"),
            period.average_level
        ));
    }
    for period in &low_periods {
        recommendations.push(format!(
            "Plan rest between {} and {} (down to {:.0}%)",
            period.start.format("%a %H:%M"),
            period.end.format("%H:%M"),
            period.extreme_level
        ));
    }
    match trend.direction {
        TrendDirection::Decreasing => recommendations
            .push("Levels trend downward over this window - protect time for recovery".to_string()),
        TrendDirection::Increasing => recommendations
            .push("Levels trend upward - later slots suit heavier commitments".to_string()),
        TrendDirection::Stable => {}
    }
    if !points.is_empty() && overall_confidence < config.low_confidence {
        recommendations
            .push("Forecast confidence is low - log more check-ins to improve it".to_string());
    }

    ForecastInsights {
        peak_periods,
        low_periods,
        trend,
        recommendations,
    }
}

fn detect_periods(
    points: &[PredictionPoint],
    qualifies: impl Fn(f64) -> bool,
    extreme: fn(f64, f64) -> f64,
    merge_gap_hours: f64,
) -> Vec<Period> {
    // (start, end, sum, count, extreme)
    let mut runs: Vec<(DateTime<Utc>, DateTime<Utc>, f64, usize, f64)> = Vec::new();
    let merge_gap = Duration::minutes((merge_gap_hours * 60.0).round() as i64);

    for point in points.iter().filter(|p| qualifies(p.predicted_level)) {
        let point_end = point.time + Duration::hours(1);
        match runs.last_mut() {
            Some(run) if point.time - run.1 <= merge_gap => {
                run.1 = point_end;
                run.2 += point.predicted_level;
                run.3 += 1;
                run.4 = extreme(run.4, point.predicted_level);
            }
            _ => runs.push((
                point.time,
                point_end,
                point.predicted_level,
                1,
                point.predicted_level,
            )),
        }
    }

    runs.into_iter()
        .map(|(start, end, sum, count, extreme_level)| Period {
            start,
            end,
            average_level: sum / count as f64,
            extreme_level,
            points: count,
        })
        .collect()
}

fn summarize_trend(points: &[PredictionPoint], threshold: f64) -> TrendSummary {
    let delta = match (points.first(), points.last()) {
        (Some(first), Some(last)) => last.predicted_level - first.predicted_level,
        _ => 0.0,
    };

    let direction = if delta > threshold {
        TrendDirection::Increasing
    } else if delta < -threshold {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };

    TrendSummary { delta, direction }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn series(levels: &[f64]) -> Vec<PredictionPoint> {
        let anchor = Utc.with_ymd_and_hms(2024, 9, 23, 6, 0, 0).unwrap();
        levels
            .iter()
            .enumerate()
            .map(|(i, level)| PredictionPoint {
                hour_offset: i as u32 + 1,
                time: anchor + Duration::hours(i as i64 + 1),
                predicted_level: *level,
                confidence: 0.7,
                contributions: BTreeMap::new(),
                uncertainty: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_single_gap_merged() {
        // 80, 80, 70, 80 -> one peak period spanning four hours
        let points = series(&[50.0, 80.0, 80.0, 70.0, 80.0, 50.0]);
        let insights = analyze(&points, 0.7, &InsightConfig::default());

        assert_eq!(insights.peak_periods.len(), 1);
        let period = &insights.peak_periods[0];
        assert_eq!(period.start, points[1].time);
        assert_eq!(period.end, points[4].time + Duration::hours(1));
        assert_eq!(period.points, 3);
        assert_eq!(period.extreme_level, 80.0);
    }

    #[test]
    fn test_wide_gap_splits() {
        let points = series(&[80.0, 50.0, 50.0, 80.0]);
        let insights = analyze(&points, 0.7, &InsightConfig::default());
        assert_eq!(insights.peak_periods.len(), 2);
    }

    #[test]
    fn test_low_periods_and_trend() {
        let points = series(&[60.0, 45.0, 25.0, 20.0]);
        let insights = analyze(&points, 0.7, &InsightConfig::default());

        assert_eq!(insights.low_periods.len(), 1);
        assert_eq!(insights.low_periods[0].extreme_level, 20.0);
        assert_eq!(insights.trend.direction, TrendDirection::Decreasing);
        assert_eq!(insights.trend.delta, -40.0);
        assert!(insights.is_low(points[3].time));
        assert!(!insights.is_peak(points[0].time));
    }

    #[test]
    fn test_stable_within_threshold() {
        let points = series(&[50.0, 53.0, 54.0]);
        let insights = analyze(&points, 0.2, &InsightConfig::default());
        assert_eq!(insights.trend.direction, TrendDirection::Stable);
        assert!(insights
            .recommendations
            .iter()
            .any(|r| r.contains("confidence is low")));
    }
}
