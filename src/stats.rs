//! Shared scoring and statistics helpers

use statrs::statistics::Statistics;

use crate::models::ItemCategory;

pub const MIN_LEVEL: f64 = 0.0;
pub const MAX_LEVEL: f64 = 100.0;

/// Clamp a level into [0, 100]. NaN maps to the lower bound.
pub fn clamp_level(level: f64) -> f64 {
    if level.is_nan() {
        return MIN_LEVEL;
    }
    level.clamp(MIN_LEVEL, MAX_LEVEL)
}

/// Arithmetic mean, `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.mean())
    }
}

/// Population variance, 0 for fewer than two values
pub fn population_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        values.population_variance()
    }
}

/// Population standard deviation, 0 for fewer than two values
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        0.0
    } else {
        values.population_std_dev()
    }
}

/// Cyclic effect peaking at `peak_hour`, in [-1, 1]
pub fn circadian(hour: u32, peak_hour: u32) -> f64 {
    let phase = (hour as f64 - peak_hour as f64) / 24.0;
    (2.0 * std::f64::consts::PI * phase).cos()
}

/// Closeness of a predicted level to a requirement, in [0, 1]
pub fn resource_match(predicted: f64, required: f64) -> f64 {
    (1.0 - (predicted - required).abs() / MAX_LEVEL).clamp(0.0, 1.0)
}

/// How well a start hour suits a category, in [0, 1]
pub fn time_of_day_suitability(category: ItemCategory, hour: u32) -> f64 {
    let (best, good): (&[u32], &[u32]) = match category {
        ItemCategory::Focus => (&[9, 10, 11], &[8, 12, 13, 14, 15]),
        ItemCategory::Meeting => (&[10, 11, 13, 14, 15], &[9, 12, 16]),
        ItemCategory::Social => (&[12, 17, 18, 19], &[13, 16, 20]),
        ItemCategory::Admin => (&[13, 14, 15, 16], &[11, 12, 17]),
        ItemCategory::Exercise => (&[7, 8, 17, 18], &[6, 9, 16, 19]),
        ItemCategory::Recovery => (&[12, 13, 15, 16], &[11, 14, 17]),
        ItemCategory::Personal | ItemCategory::Other => return 0.5,
    };

    if best.contains(&hour) {
        1.0
    } else if good.contains(&hour) {
        0.7
    } else {
        0.3
    }
}
