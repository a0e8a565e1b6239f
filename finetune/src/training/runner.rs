use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand_distr::{Beta, Distribution};
use shared::ClassTally;
use tch::nn::{self, OptimizerConfig};
use tch::{Kind, Reduction, Tensor};

use super::precision::GradScaler;
use super::{EpochRunner, EpochSampler, TrainError, TrainStats, ValidationStats};
use crate::remote::ImageSource;
use crate::vision::dataset::{Batch, SampledDataset, collate};
use crate::vision::ModelState;

pub struct TchRunnerParts<'a, S> {
    pub model: ModelState,
    pub train: SampledDataset<'a, S>,
    pub val: SampledDataset<'a, S>,
    /// Set when the catalog is imbalanced: weights the loss and the sampler.
    pub class_weights: Option<Vec<f64>>,
    pub batch_size: usize,
    pub fetch_workers: usize,
    pub learning_rate: f64,
    pub mixup_alpha: Option<f64>,
    /// Autocast forward passes with loss scaling. Only takes effect on CUDA.
    pub mixed_precision: bool,
    pub seed: Option<u64>,
}

/// Adam fine-tuning of the trainable head over remote datasets.
pub struct TchRunner<'a, S> {
    model: ModelState,
    optimizer: nn::Optimizer,
    train: SampledDataset<'a, S>,
    val: SampledDataset<'a, S>,
    sampler: EpochSampler,
    loss_weights: Option<Tensor>,
    mixup: Option<Beta<f64>>,
    scaler: Option<GradScaler>,
    trainable: Vec<Tensor>,
    batch_size: usize,
    fetch_workers: usize,
    learning_rate: f64,
    rng: StdRng,
}

impl<'a, S: ImageSource> TchRunner<'a, S> {
    pub fn new(parts: TchRunnerParts<'a, S>) -> Result<Self, TrainError> {
        if parts.train.is_empty() {
            return Err(TrainError::EmptySplit("train"));
        }
        if parts.val.is_empty() {
            return Err(TrainError::EmptySplit("validation"));
        }
        if parts.batch_size == 0 {
            return Err(TrainError::Setting("batch size must be positive".into()));
        }

        let device = parts.model.device();
        let optimizer = nn::Adam::default().build(parts.model.var_store(), parts.learning_rate)?;
        let (sampler, loss_weights) = match &parts.class_weights {
            Some(weights) => {
                let sampler = EpochSampler::weighted(&parts.train.labels(), weights)?;
                let as_f32: Vec<f32> = weights.iter().map(|&w| w as f32).collect();
                (sampler, Some(Tensor::from_slice(&as_f32).to_device(device)))
            }
            None => (EpochSampler::Shuffle, None),
        };
        let mixup = parts
            .mixup_alpha
            .map(|alpha| Beta::new(alpha, alpha))
            .transpose()
            .map_err(|e| TrainError::Setting(format!("mixup alpha: {}", e)))?;
        let scaler = (parts.mixed_precision && device.is_cuda()).then(GradScaler::default);
        if device.is_cuda() {
            tch::Cuda::cudnn_set_benchmark(true);
        }
        if scaler.is_some() {
            log::info!("Mixed precision training enabled");
        }
        let trainable = parts.model.var_store().trainable_variables();
        let rng = match parts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Self {
            model: parts.model,
            optimizer,
            train: parts.train,
            val: parts.val,
            sampler,
            loss_weights,
            mixup,
            scaler,
            trainable,
            batch_size: parts.batch_size,
            fetch_workers: parts.fetch_workers,
            learning_rate: parts.learning_rate,
            rng,
        })
    }

    pub fn into_model(self) -> ModelState {
        self.model
    }

    fn criterion(&self, logits: &Tensor, targets: &Tensor) -> Tensor {
        logits.cross_entropy_loss(targets, self.loss_weights.as_ref(), Reduction::Mean, -100, 0.0)
    }

    /// Training-mode forward pass, autocast when mixed precision is on.
    /// Logits come back in full precision.
    fn forward_train(&self, images: &Tensor) -> Tensor {
        tch::autocast(self.scaler.is_some(), || self.model.forward_t(images, true)).to_kind(Kind::Float)
    }

    /// Forward pass and loss for one batch, blending pairs when mixup is on.
    /// Returns the loss and the logits.
    fn train_step(&mut self, batch: &Batch) -> (Tensor, Tensor) {
        let Some(beta) = self.mixup.as_ref() else {
            let logits = self.forward_train(&batch.images);
            let loss = self.criterion(&logits, &batch.labels);
            return (loss, logits);
        };

        let lambda = beta.sample(&mut self.rng);
        let mut pairing: Vec<i64> = (0..batch.len() as i64).collect();
        pairing.shuffle(&mut self.rng);
        let pairing = Tensor::from_slice(&pairing).to_device(self.model.device());

        let mixed = &batch.images * lambda + batch.images.index_select(0, &pairing) * (1.0 - lambda);
        let labels_b = batch.labels.index_select(0, &pairing);
        let logits = self.forward_train(&mixed);
        let loss = self.criterion(&logits, &batch.labels) * lambda
            + self.criterion(&logits, &labels_b) * (1.0 - lambda);
        (loss, logits)
    }
}

fn correct_count(logits: &Tensor, labels: &Tensor) -> i64 {
    logits
        .argmax(-1, false)
        .eq_tensor(labels)
        .sum(Kind::Int64)
        .int64_value(&[])
}

fn ratio(numerator: f64, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

impl<S: ImageSource> EpochRunner for TchRunner<'_, S> {
    type Snapshot = Vec<(String, Tensor)>;

    async fn train_epoch(&mut self, _epoch: usize) -> Result<TrainStats, TrainError> {
        let order = self.sampler.epoch_order(self.train.len(), &mut self.rng);
        let mut loss_sum = 0.0;
        let mut correct = 0i64;
        let mut seen = 0usize;
        let mut dropped = 0usize;

        for chunk in order.chunks(self.batch_size) {
            let results = self
                .train
                .load_batch(chunk, self.fetch_workers, &mut self.rng)
                .await;
            let Some(batch) = collate(results, self.model.device()) else {
                dropped += chunk.len();
                continue;
            };
            dropped += batch.dropped;

            let (loss, logits) = self.train_step(&batch);
            match self.scaler.as_mut() {
                Some(scaler) => {
                    if !scaler.step(&mut self.optimizer, &self.trainable, &loss) {
                        log::debug!("Gradient overflow, loss scale now {}", scaler.scale());
                    }
                }
                None => self.optimizer.backward_step(&loss),
            }

            let n = batch.len();
            loss_sum += loss.double_value(&[]) * n as f64;
            correct += tch::no_grad(|| correct_count(&logits, &batch.labels));
            seen += n;
        }

        Ok(TrainStats {
            loss: ratio(loss_sum, seen),
            accuracy: ratio(correct as f64, seen),
            samples: seen,
            dropped,
        })
    }

    async fn validate(&mut self, _epoch: usize) -> Result<ValidationStats, TrainError> {
        let indices: Vec<usize> = (0..self.val.len()).collect();
        let num_classes = self.model.identity().num_classes;
        let mut per_class = vec![ClassTally::default(); num_classes];
        let mut loss_sum = 0.0;
        let mut correct = 0usize;
        let mut seen = 0usize;
        let mut dropped = 0usize;

        for chunk in indices.chunks(self.batch_size) {
            let results = self
                .val
                .load_batch(chunk, self.fetch_workers, &mut self.rng)
                .await;
            let Some(batch) = collate(results, self.model.device()) else {
                dropped += chunk.len();
                continue;
            };
            dropped += batch.dropped;

            let (loss, predictions) = tch::no_grad(|| {
                let logits = self.model.forward_t(&batch.images, false);
                (self.criterion(&logits, &batch.labels), logits.argmax(-1, false))
            });
            let predictions = Vec::<i64>::try_from(&predictions)?;
            let labels = Vec::<i64>::try_from(&batch.labels)?;

            for (&predicted, &label) in predictions.iter().zip(&labels) {
                let tally = &mut per_class[label as usize];
                tally.total += 1;
                if predicted == label {
                    tally.correct += 1;
                    correct += 1;
                }
            }
            loss_sum += loss.double_value(&[]) * labels.len() as f64;
            seen += labels.len();
        }

        if seen == 0 {
            log::warn!("No validation sample could be fetched this epoch");
        }
        Ok(ValidationStats {
            loss: ratio(loss_sum, seen),
            accuracy: ratio(correct as f64, seen),
            per_class,
            samples: seen,
            dropped,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
        self.optimizer.set_lr(lr);
    }

    fn snapshot(&self) -> Self::Snapshot {
        self.model.named_weights()
    }

    fn restore(&mut self, snapshot: &Self::Snapshot) -> Result<(), TrainError> {
        self.model.load_named_weights(snapshot)?;
        Ok(())
    }
}
