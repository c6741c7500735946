//! Ensemble combiner
//!
//! Weighted average of the strategies that produced a value, with weights
//! renormalised over only those strategies. Combined confidence is penalised
//! by the spread across strategies.

use std::collections::BTreeMap;

use super::strategy::StrategyPrediction;
use crate::stats::{clamp_level, population_std_dev};

/// Largest confidence penalty applied for disagreement
const MAX_SPREAD_PENALTY: f64 = 0.3;

/// Result of combining strategy outputs for one hour
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedPrediction {
    pub level: f64,
    pub confidence: f64,
    pub uncertainty: f64,
    pub contributions: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct EnsembleCombiner {
    weights: BTreeMap<String, f64>,
    generation: u64,
}

impl EnsembleCombiner {
    /// Equal trust in every named strategy
    pub fn equal<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let share = if names.is_empty() {
            0.0
        } else {
            1.0 / names.len() as f64
        };

        EnsembleCombiner {
            weights: names.into_iter().map(|n| (n, share)).collect(),
            generation: 0,
        }
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    /// Bumped whenever weights change
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace weights for known strategies. Unknown names are ignored,
    /// negative or non-finite weights are treated as zero.
    pub fn set_weights(&mut self, weights: &BTreeMap<String, f64>) {
        for (name, weight) in weights {
            if let Some(slot) = self.weights.get_mut(name) {
                *slot = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
            }
        }
        self.generation += 1;
    }

    pub fn combine(&self, outputs: &[(String, StrategyPrediction)]) -> Option<CombinedPrediction> {
        if outputs.is_empty() {
            return None;
        }

        let raw: Vec<f64> = outputs
            .iter()
            .map(|(name, _)| self.weights.get(name).copied().unwrap_or(0.0))
            .collect();
        let total: f64 = raw.iter().sum();
        let normalized: Vec<f64> = if total > 0.0 {
            raw.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / outputs.len() as f64; outputs.len()]
        };

        let mut level = 0.0;
        let mut confidence = 0.0;
        for ((_, prediction), weight) in outputs.iter().zip(&normalized) {
            level += prediction.level * weight;
            confidence += prediction.confidence * weight;
        }

        let levels: Vec<f64> = outputs.iter().map(|(_, p)| p.level).collect();
        let uncertainty = population_std_dev(&levels);
        confidence -= (uncertainty / 100.0).min(MAX_SPREAD_PENALTY);

        Some(CombinedPrediction {
            level: clamp_level(level),
            confidence: confidence.clamp(0.0, 1.0),
            uncertainty,
            contributions: outputs
                .iter()
                .map(|(name, p)| (name.clone(), p.level))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(level: f64, confidence: f64) -> StrategyPrediction {
        StrategyPrediction { level, confidence }
    }

    #[test]
    fn test_equal_initial_weights() {
        let combiner = EnsembleCombiner::equal(["trend", "pattern", "learned"]);
        for weight in combiner.weights().values() {
            assert!((weight - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_renormalizes_over_present_strategies() {
        let mut combiner = EnsembleCombiner::equal(["trend", "pattern", "learned"]);
        let mut weights = BTreeMap::new();
        weights.insert("trend".to_string(), 0.2);
        weights.insert("pattern".to_string(), 0.6);
        weights.insert("learned".to_string(), 0.2);
        combiner.set_weights(&weights);

        // Learned model absent: weights 0.2 and 0.6 renormalise to 0.25 / 0.75
        let combined = combiner
            .combine(&[
                ("trend".to_string(), p(40.0, 0.8)),
                ("pattern".to_string(), p(80.0, 0.8)),
            ])
            .unwrap();

        assert!((combined.level - 70.0).abs() < 1e-9);
        assert!((combined.uncertainty - 20.0).abs() < 1e-9);
        // 0.8 - min(0.3, 20/100)
        assert!((combined.confidence - 0.6).abs() < 1e-9);
        assert_eq!(combined.contributions.len(), 2);
        assert_eq!(combiner.generation(), 1);
    }

    #[test]
    fn test_penalty_capped() {
        let combiner = EnsembleCombiner::equal(["trend", "pattern"]);
        let combined = combiner
            .combine(&[
                ("trend".to_string(), p(0.0, 0.9)),
                ("pattern".to_string(), p(100.0, 0.9)),
            ])
            .unwrap();
        assert!((combined.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_spread_never_raises_confidence() {
        let combiner = EnsembleCombiner::equal(["trend", "pattern"]);
        let mut previous = f64::MAX;
        for spread in [0.0, 5.0, 10.0, 20.0, 40.0] {
            let combined = combiner
                .combine(&[
                    ("trend".to_string(), p(50.0 - spread, 0.7)),
                    ("pattern".to_string(), p(50.0 + spread, 0.7)),
                ])
                .unwrap();
            assert!((combined.level - 50.0).abs() < 1e-9);
            assert!(combined.confidence <= previous);
            previous = combined.confidence;
        }
    }

    #[test]
    fn test_empty_outputs() {
        let combiner = EnsembleCombiner::equal(["trend"]);
        assert!(combiner.combine(&[]).is_none());
    }
}
