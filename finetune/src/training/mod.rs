pub mod engine;
pub mod precision;
pub mod runner;
pub mod sampler;
pub mod scheduler;

pub use engine::{
    EpochOutcome, EpochRunner, RunState, TrainStats, TrainingLoop, TrainingOutcome, ValidationStats,
};
pub use precision::GradScaler;
pub use runner::{TchRunner, TchRunnerParts};
pub use sampler::{ClassBalance, EpochSampler};
pub use scheduler::PlateauScheduler;

use crate::vision::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("The {0} split is empty")]
    EmptySplit(&'static str),
    #[error("Invalid training setting: {0}")]
    Setting(String),
    #[error("Training finished without a best snapshot")]
    NoSnapshot,
}

/// Batch size from the number of training samples: small sets get small
/// batches so an epoch still has several optimizer steps.
pub fn batch_size_for(train_samples: usize) -> usize {
    if train_samples < 100 {
        train_samples.min(8)
    } else if train_samples > 1000 {
        64
    } else {
        32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_follows_train_split_size() {
        assert_eq!(batch_size_for(5), 5);
        assert_eq!(batch_size_for(50), 8);
        assert_eq!(batch_size_for(99), 8);
        assert_eq!(batch_size_for(100), 32);
        assert_eq!(batch_size_for(500), 32);
        assert_eq!(batch_size_for(1000), 32);
        assert_eq!(batch_size_for(1001), 64);
        assert_eq!(batch_size_for(5000), 64);
    }
}
