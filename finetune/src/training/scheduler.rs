use crate::config::TrainingConfig;

const MIN_LR_DELTA: f64 = 1e-8;

/// Reduce-on-plateau for a metric that should increase (validation accuracy).
///
/// An epoch counts as an improvement only when the metric beats the best so
/// far by the relative `threshold`. Once the number of consecutive bad epochs
/// exceeds `patience` the rate is multiplied by `factor` and the count resets.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    best: f64,
    bad_epochs: usize,
}

impl PlateauScheduler {
    pub fn new(factor: f64, patience: usize, threshold: f64, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            threshold,
            min_lr,
            best: f64::NEG_INFINITY,
            bad_epochs: 0,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.lr_factor, config.lr_patience, config.lr_threshold, config.min_lr)
    }

    pub fn bad_epochs(&self) -> usize {
        self.bad_epochs
    }

    /// Returns the new learning rate when it should change.
    pub fn step(&mut self, metric: f64, current_lr: f64) -> Option<f64> {
        if metric > self.best * (1.0 + self.threshold) {
            self.best = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.bad_epochs <= self.patience {
            return None;
        }
        self.bad_epochs = 0;
        let reduced = (current_lr * self.factor).max(self.min_lr);
        (current_lr - reduced > MIN_LR_DELTA).then_some(reduced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_after_patience_plus_one_bad_epochs() {
        let mut scheduler = PlateauScheduler::new(0.5, 3, 1e-4, 0.0);
        let mut lr = 0.001;
        assert_eq!(scheduler.step(0.60, lr), None);
        for _ in 0..3 {
            assert_eq!(scheduler.step(0.60, lr), None);
        }
        lr = scheduler.step(0.55, lr).unwrap();
        assert!((lr - 0.0005).abs() < 1e-12);
        assert_eq!(scheduler.bad_epochs(), 0);

        // The counter restarts, so it takes another four bad epochs.
        for _ in 0..3 {
            assert_eq!(scheduler.step(0.60, lr), None);
        }
        assert!(scheduler.step(0.60, lr).is_some());
    }

    #[test]
    fn tiny_gains_do_not_count_as_improvement() {
        let mut scheduler = PlateauScheduler::new(0.5, 0, 1e-2, 0.0);
        assert_eq!(scheduler.step(0.5, 0.1), None);
        // 0.5 * 1.01 = 0.505 is the bar to beat.
        assert!(scheduler.step(0.504, 0.1).is_some());
        assert_eq!(scheduler.step(0.6, 0.05), None);
    }

    #[test]
    fn respects_minimum_rate() {
        let mut scheduler = PlateauScheduler::new(0.5, 0, 1e-4, 0.001);
        scheduler.step(0.5, 0.0015);
        assert_eq!(scheduler.step(0.4, 0.0015), Some(0.001));
        assert_eq!(scheduler.step(0.4, 0.001), None);
    }
}
