use rand::Rng;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::seq::SliceRandom;

use super::TrainError;

/// Class-count statistics, computed once from the catalog before training.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassBalance {
    pub ratio: f64,
    pub imbalanced: bool,
    /// Inverse class frequency, `1 / count`.
    pub class_weights: Vec<f64>,
}

impl ClassBalance {
    pub fn from_counts(counts: &[usize], threshold: f64) -> Self {
        let max = counts.iter().copied().max().unwrap_or(0);
        let min = counts.iter().copied().min().unwrap_or(0);
        let ratio = if min == 0 {
            f64::INFINITY
        } else {
            max as f64 / min as f64
        };
        Self {
            ratio,
            imbalanced: ratio > threshold,
            class_weights: counts
                .iter()
                .map(|&c| if c == 0 { 0.0 } else { 1.0 / c as f64 })
                .collect(),
        }
    }
}

/// Visiting order of the train split for one epoch.
#[derive(Debug, Clone)]
pub enum EpochSampler {
    /// Every sample once, in a fresh random order.
    Shuffle,
    /// As many draws as samples, with replacement, weighted per sample.
    Weighted(WeightedIndex<f64>),
}

impl EpochSampler {
    /// Per-sample weights are the class weight of each sample's label.
    pub fn weighted(labels: &[usize], class_weights: &[f64]) -> Result<Self, TrainError> {
        let weights = labels
            .iter()
            .map(|&label| class_weights.get(label).copied().unwrap_or(0.0));
        WeightedIndex::new(weights)
            .map(EpochSampler::Weighted)
            .map_err(|e| TrainError::Setting(format!("sample weights: {}", e)))
    }

    pub fn epoch_order<R: Rng + ?Sized>(&self, len: usize, rng: &mut R) -> Vec<usize> {
        match self {
            EpochSampler::Shuffle => {
                let mut order: Vec<usize> = (0..len).collect();
                order.shuffle(rng);
                order
            }
            EpochSampler::Weighted(dist) => (0..len).map(|_| dist.sample(rng)).collect(),
        }
    }
}
