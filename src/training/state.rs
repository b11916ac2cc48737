// Running training statistics and per-epoch validation records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sums since the last log point
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStats {
    pub loss: f64,
    pub accuracy: f64,
    pub f1: f64,
    pub batches: usize,
}

/// Averages over the batches in a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Averages {
    pub loss: f64,
    pub accuracy: f64,
    pub f1: f64,
}

impl RunningStats {
    pub fn add(&mut self, loss: f64, accuracy: f64, f1: f64) {
        self.loss += loss;
        self.accuracy += accuracy;
        self.f1 += f1;
        self.batches += 1;
    }

    /// Zeros when nothing was accumulated
    pub fn averages(&self) -> Averages {
        if self.batches == 0 {
            return Averages::default();
        }
        let n = self.batches as f64;
        Averages {
            loss: self.loss / n,
            accuracy: self.accuracy / n,
            f1: self.f1 / n,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// High-water mark for log-point training accuracy, starting at zero
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BestAccuracy(f64);

impl BestAccuracy {
    /// Raise the mark if `accuracy` is strictly higher; true when raised
    pub fn improve(&mut self, accuracy: f64) -> bool {
        if accuracy > self.0 {
            self.0 = accuracy;
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> f64 {
        self.0
    }
}

/// One entry of `validation_results.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochResult {
    pub qualification_metrics: BTreeMap<String, f64>,
    pub loss: f64,
    pub accuracy: f64,
    pub f1: f64,
}

/// Epoch number to validation record
pub type ValidationResults = BTreeMap<usize, EpochResult>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_stats_average_and_reset() {
        let mut stats = RunningStats::default();
        stats.add(2.0, 0.5, 0.4);
        stats.add(4.0, 1.0, 0.6);

        let avg = stats.averages();
        assert_eq!(avg.loss, 3.0);
        assert_eq!(avg.accuracy, 0.75);
        assert!((avg.f1 - 0.5).abs() < 1e-12);

        stats.reset();
        assert_eq!(stats.batches, 0);
        assert_eq!(stats.averages(), Averages::default());
    }

    #[test]
    fn test_best_accuracy_is_strict() {
        let mut best = BestAccuracy::default();
        assert_eq!(best.get(), 0.0);
        // Zero accuracy never beats the initial mark
        assert!(!best.improve(0.0));
        assert!(best.improve(0.3));
        assert!(!best.improve(0.3));
        assert!(!best.improve(0.1));
        assert!(best.improve(0.31));
        assert_eq!(best.get(), 0.31);
    }

    #[test]
    fn test_results_serialize_with_epoch_keys() {
        let mut results = ValidationResults::new();
        results.insert(
            0,
            EpochResult {
                qualification_metrics: [("bleu_1".to_string(), 0.5)].into(),
                loss: 1.5,
                accuracy: 0.25,
                f1: 0.2,
            },
        );
        let json: serde_json::Value = serde_json::to_value(&results).unwrap();
        assert_eq!(json["0"]["qualification_metrics"]["bleu_1"], 0.5);
        assert_eq!(json["0"]["accuracy"], 0.25);
    }
}
