use std::time::{Duration, Instant};

use shared::{ClassTally, EpochRecord, StopReason};

use super::{PlateauScheduler, TrainError};
use crate::config::TrainingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrainStats {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationStats {
    pub loss: f64,
    pub accuracy: f64,
    pub per_class: Vec<ClassTally>,
    pub samples: usize,
    pub dropped: usize,
}

/// One model's worth of epoch work. The loop only decides when to stop.
#[allow(async_fn_in_trait)]
pub trait EpochRunner {
    type Snapshot;

    async fn train_epoch(&mut self, epoch: usize) -> Result<TrainStats, TrainError>;
    async fn validate(&mut self, epoch: usize) -> Result<ValidationStats, TrainError>;
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
    fn snapshot(&self) -> Self::Snapshot;
    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<(), TrainError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    Improved,
    Plateaued,
}

/// Best-accuracy and patience bookkeeping of a run.
#[derive(Debug, Clone)]
pub struct RunState {
    epoch: usize,
    best_accuracy: f64,
    epochs_without_improvement: usize,
    patience: usize,
    target_accuracy: f64,
    max_epochs: Option<usize>,
}

impl RunState {
    pub fn new(target_accuracy: f64, patience: usize, max_epochs: Option<usize>) -> Self {
        Self {
            epoch: 0,
            best_accuracy: f64::NEG_INFINITY,
            epochs_without_improvement: 0,
            patience,
            target_accuracy,
            max_epochs,
        }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.epochs_without_improvement
    }

    /// Strictly better accuracy resets the patience counter.
    pub fn observe(&mut self, accuracy: f64) -> EpochOutcome {
        if accuracy > self.best_accuracy {
            self.best_accuracy = accuracy;
            self.epochs_without_improvement = 0;
            EpochOutcome::Improved
        } else {
            self.epochs_without_improvement += 1;
            EpochOutcome::Plateaued
        }
    }

    pub fn verdict(&self, accuracy: f64) -> Option<StopReason> {
        if accuracy >= self.target_accuracy {
            Some(StopReason::TargetReached)
        } else if self.epochs_without_improvement >= self.patience {
            Some(StopReason::EarlyStopped)
        } else if self.max_epochs.is_some_and(|max| self.epoch + 1 >= max) {
            Some(StopReason::EpochLimit)
        } else {
            None
        }
    }

    pub fn advance(&mut self) {
        self.epoch += 1;
    }
}

#[derive(Debug)]
pub struct TrainingOutcome<S> {
    pub best: S,
    pub best_accuracy: f64,
    pub final_accuracy: f64,
    pub stop_reason: StopReason,
    pub epochs: usize,
    pub final_lr: f64,
    pub elapsed: Duration,
    pub history: Vec<EpochRecord>,
}

pub struct TrainingLoop<'a> {
    class_names: &'a [String],
    scheduler: PlateauScheduler,
    state: RunState,
}

impl<'a> TrainingLoop<'a> {
    pub fn new(config: &TrainingConfig, class_names: &'a [String]) -> Self {
        Self {
            class_names,
            scheduler: PlateauScheduler::from_config(config),
            state: RunState::new(config.target_accuracy, config.patience, config.max_epochs),
        }
    }

    /// Runs epochs until a stop condition holds, then leaves the runner on
    /// the best weights seen and returns them.
    pub async fn run<R: EpochRunner>(mut self, runner: &mut R) -> Result<TrainingOutcome<R::Snapshot>, TrainError> {
        log::info!("=== Starting Training ===");
        let started = Instant::now();
        let mut history = Vec::new();
        let mut best = None;

        let (stop_reason, final_accuracy) = loop {
            let epoch = self.state.epoch();
            log::info!("Epoch {}", epoch);

            let train = runner.train_epoch(epoch).await?;
            let val = runner.validate(epoch).await?;
            let lr = runner.learning_rate();
            self.log_epoch(&train, &val, lr);

            history.push(EpochRecord {
                epoch,
                train_loss: train.loss,
                train_accuracy: train.accuracy,
                val_loss: val.loss,
                val_accuracy: val.accuracy,
                learning_rate: lr,
                per_class: val.per_class.clone(),
            });

            if let Some(new_lr) = self.scheduler.step(val.accuracy, lr) {
                runner.set_learning_rate(new_lr);
                log::info!("Learning rate adjusted: {} -> {}", lr, new_lr);
            }

            match self.state.observe(val.accuracy) {
                EpochOutcome::Improved => {
                    best = Some(runner.snapshot());
                    log::info!("New best accuracy: {:.4}", val.accuracy);
                }
                EpochOutcome::Plateaued => log::info!(
                    "Epochs without improvement: {}/{}",
                    self.state.epochs_without_improvement(),
                    self.state.patience
                ),
            }

            if let Some(reason) = self.state.verdict(val.accuracy) {
                break (reason, val.accuracy);
            }
            self.state.advance();
        };

        let best = best.ok_or(TrainError::NoSnapshot)?;
        runner.restore(&best)?;
        let outcome = TrainingOutcome {
            best,
            best_accuracy: self.state.best_accuracy(),
            final_accuracy,
            stop_reason,
            epochs: self.state.epoch() + 1,
            final_lr: runner.learning_rate(),
            elapsed: started.elapsed(),
            history,
        };
        log::info!(
            "=== Training Summary === Stop: {} | Total Time: {:.1}s | Final Val Acc: {:.4} | Best Val Acc: {:.4} | Epochs: {} | LR: {}",
            outcome.stop_reason,
            outcome.elapsed.as_secs_f64(),
            outcome.final_accuracy,
            outcome.best_accuracy,
            outcome.epochs,
            outcome.final_lr
        );
        Ok(outcome)
    }

    fn log_epoch(&self, train: &TrainStats, val: &ValidationStats, lr: f64) {
        log::info!("Train Loss: {:.4} Acc: {:.4}", train.loss, train.accuracy);
        log::info!("Val Loss:   {:.4} Acc: {:.4}", val.loss, val.accuracy);
        log::info!("LR: {}", lr);
        if train.dropped + val.dropped > 0 {
            log::warn!(
                "Dropped {} train and {} validation samples this epoch",
                train.dropped,
                val.dropped
            );
        }
        for (name, tally) in self.class_names.iter().zip(&val.per_class) {
            if let Some(acc) = tally.accuracy() {
                log::info!("  Class {}: {:.4} ({}/{})", name, acc, tally.correct, tally.total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed validation accuracy curve. The "weights" are the epoch
    /// number the snapshot was taken at.
    struct ScriptedRunner {
        accuracies: Vec<f64>,
        epochs_run: usize,
        lr: f64,
        lr_changes: Vec<(usize, f64)>,
        current_epoch: usize,
        restored: Option<usize>,
    }

    impl ScriptedRunner {
        fn new(accuracies: &[f64]) -> Self {
            Self {
                accuracies: accuracies.to_vec(),
                epochs_run: 0,
                lr: 0.001,
                lr_changes: Vec::new(),
                current_epoch: 0,
                restored: None,
            }
        }
    }

    impl EpochRunner for ScriptedRunner {
        type Snapshot = usize;

        async fn train_epoch(&mut self, epoch: usize) -> Result<TrainStats, TrainError> {
            self.current_epoch = epoch;
            self.epochs_run += 1;
            Ok(TrainStats {
                loss: 1.0 / (epoch + 1) as f64,
                accuracy: 0.5,
                samples: 40,
                dropped: 0,
            })
        }

        async fn validate(&mut self, epoch: usize) -> Result<ValidationStats, TrainError> {
            let accuracy = self.accuracies.get(epoch).copied().unwrap_or(0.1);
            Ok(ValidationStats {
                loss: 1.0 - accuracy,
                accuracy,
                per_class: vec![ClassTally { correct: 1, total: 2 }],
                samples: 10,
                dropped: 0,
            })
        }

        fn learning_rate(&self) -> f64 {
            self.lr
        }

        fn set_learning_rate(&mut self, lr: f64) {
            self.lr_changes.push((self.current_epoch, lr));
            self.lr = lr;
        }

        fn snapshot(&self) -> usize {
            self.current_epoch
        }

        fn restore(&mut self, snapshot: &usize) -> Result<(), TrainError> {
            self.restored = Some(*snapshot);
            Ok(())
        }
    }

    fn config() -> TrainingConfig {
        TrainingConfig::default()
    }

    #[tokio::test]
    async fn early_stops_after_patience_epochs_and_returns_first_weights() {
        let names = vec!["a".to_string()];
        let mut runner = ScriptedRunner::new(&[0.6, 0.5, 0.55, 0.6, 0.4, 0.59, 0.99]);
        let outcome = TrainingLoop::new(&config(), &names).run(&mut runner).await.unwrap();

        assert_eq!(outcome.stop_reason, StopReason::EarlyStopped);
        assert_eq!(runner.epochs_run, 6);
        assert_eq!(outcome.epochs, 6);
        assert_eq!(outcome.best, 0);
        assert_eq!(runner.restored, Some(0));
        assert_eq!(outcome.best_accuracy, 0.6);
        assert_eq!(outcome.final_accuracy, 0.59);
        assert_eq!(outcome.history.len(), 6);
    }

    #[tokio::test]
    async fn stops_at_the_epoch_reaching_the_target() {
        let names = vec!["a".to_string()];
        let mut runner = ScriptedRunner::new(&[0.5, 0.7, 0.96, 0.99]);
        let outcome = TrainingLoop::new(&config(), &names).run(&mut runner).await.unwrap();

        assert_eq!(outcome.stop_reason, StopReason::TargetReached);
        assert_eq!(runner.epochs_run, 3);
        assert_eq!(outcome.best, 2);
        assert_eq!(outcome.final_accuracy, 0.96);
    }

    #[tokio::test]
    async fn epoch_cap_bounds_the_run() {
        let names = vec!["a".to_string()];
        let config = TrainingConfig {
            max_epochs: Some(3),
            ..config()
        };
        let mut runner = ScriptedRunner::new(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        let outcome = TrainingLoop::new(&config, &names).run(&mut runner).await.unwrap();

        assert_eq!(outcome.stop_reason, StopReason::EpochLimit);
        assert_eq!(runner.epochs_run, 3);
        assert_eq!(outcome.best, 2);
    }

    #[tokio::test]
    async fn plateau_halves_the_rate_independently_of_early_stopping() {
        let names = vec!["a".to_string()];
        let config = TrainingConfig {
            patience: 10,
            ..config()
        };
        // Best at epoch 0, then four flat epochs: the scheduler fires on the
        // fourth (patience 3 exceeded) while early stopping keeps going.
        let mut runner = ScriptedRunner::new(&[0.5, 0.5, 0.5, 0.5, 0.5, 0.96]);
        let outcome = TrainingLoop::new(&config, &names).run(&mut runner).await.unwrap();

        assert_eq!(runner.lr_changes, vec![(4, 0.0005)]);
        assert_eq!(outcome.stop_reason, StopReason::TargetReached);
        assert_eq!(outcome.final_lr, 0.0005);
        assert_eq!(outcome.history[5].learning_rate, 0.0005);
    }

    #[test]
    fn run_state_counts_only_strict_improvements() {
        let mut state = RunState::new(0.95, 2, None);
        assert_eq!(state.observe(0.5), EpochOutcome::Improved);
        assert_eq!(state.observe(0.5), EpochOutcome::Plateaued);
        assert_eq!(state.verdict(0.5), None);
        assert_eq!(state.observe(0.4), EpochOutcome::Plateaued);
        assert_eq!(state.verdict(0.4), Some(StopReason::EarlyStopped));
        assert_eq!(state.verdict(0.95), Some(StopReason::TargetReached));
    }
}
