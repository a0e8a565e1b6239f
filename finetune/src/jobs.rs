use std::path::PathBuf;

use rand::SeedableRng;
use rand::rngs::StdRng;
use shared::{Architecture, ClassificationResult, SavedLocations};
use tch::Tensor;

use crate::catalog::class_catalog::SampleRef;
use crate::catalog::{ClassCatalog, CloudinaryService, parse_class_list};
use crate::classifier::Classifier;
use crate::config::{AppConfig, TrainingConfig};
use crate::error::JobError;
use crate::remote::{ImageFetcher, ImageSource};
use crate::storage::persistence::RunDetails;
use crate::storage::{ModelPersistence, S3Service};
use crate::training::{
    ClassBalance, TchRunner, TchRunnerParts, TrainError, TrainingLoop, TrainingOutcome, batch_size_for,
};
use crate::vision::dataset::{SampledDataset, train_val_split};
use crate::vision::{AugmentationPolicy, ModelFactory, ModelState, parse_architecture};

/// File the training job leaves the cloud path in, next to the working directory.
pub const CLOUD_PATH_FILE: &str = "model_cloud_path.txt";

#[derive(Debug, Clone, PartialEq)]
pub struct TrainRequest {
    pub model_name: String,
    pub classes: Vec<String>,
    pub architecture: Architecture,
    pub output_filename: String,
}

impl TrainRequest {
    /// `<model_name> <class_list_literal> <architecture> <output_filename>`
    pub fn from_args(args: &[String]) -> Result<Self, JobError> {
        let [model_name, classes, architecture, output_filename] = args else {
            return Err(JobError::Configuration(format!(
                "expected 4 arguments: <model_name> <class_list> <architecture> <output_filename>, got {}",
                args.len()
            )));
        };
        let architecture = parse_architecture(architecture)?;
        let classes = parse_class_list(classes)?;
        if classes.is_empty() {
            return Err(JobError::Configuration("class list is empty".into()));
        }
        Ok(Self {
            model_name: model_name.clone(),
            classes,
            architecture,
            output_filename: output_filename.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyRequest {
    pub image_url: String,
    pub local_path: PathBuf,
    pub cloud_path: String,
    pub architecture: Architecture,
    pub num_classes: usize,
}

impl ClassifyRequest {
    /// `<image_url> <local_path> <cloud_path> <architecture> <num_classes>`
    pub fn from_args(args: &[String]) -> Result<Self, JobError> {
        let [image_url, local_path, cloud_path, architecture, num_classes] = args else {
            return Err(JobError::Configuration(format!(
                "expected 5 arguments: <image_url> <local_path> <cloud_path> <architecture> <num_classes>, got {}",
                args.len()
            )));
        };
        let architecture = parse_architecture(architecture)?;
        let num_classes = num_classes
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| JobError::Configuration(format!("invalid class count '{}'", num_classes)))?;
        Ok(Self {
            image_url: image_url.clone(),
            local_path: PathBuf::from(local_path),
            cloud_path: cloud_path.clone(),
            architecture,
            num_classes,
        })
    }
}

/// Fetch the catalog, fine-tune, save locally and to the bucket.
pub async fn run_training(config: &AppConfig, request: &TrainRequest) -> Result<SavedLocations, JobError> {
    log::info!(
        "Model: {} | Classes: {:?} | Arch: {} | Out: {}",
        request.model_name,
        request.classes,
        request.architecture,
        request.output_filename
    );
    let factory = ModelFactory::for_architecture(request.architecture);
    if factory.pretrained_path(&config.pretrained_dir).is_none() {
        return Err(crate::vision::ModelError::PretrainedMissing {
            architecture: request.architecture,
            dir: config.pretrained_dir.clone(),
        }
        .into());
    }
    let lister = CloudinaryService::new(config.cdn_credentials()?);
    let catalog = ClassCatalog::fetch(&lister, &request.model_name, &request.classes).await?;
    log::info!(
        "Fetched {} images across {} classes",
        catalog.total_samples(),
        catalog.num_classes()
    );

    let model = factory.pretrained(catalog.num_classes(), &config.pretrained_dir)?;
    log::info!("Training on {:?}", factory.device());
    let fetcher = ImageFetcher::for_training();
    let (model, outcome) = fine_tune(&config.training, model, &catalog, &fetcher).await?;

    let storage = S3Service::from_settings(&config.storage).await;
    let persistence = ModelPersistence::new(storage, &config.models_dir, &config.storage);
    let details = RunDetails {
        class_names: catalog.class_names(),
        stop_reason: outcome.stop_reason,
        best_val_accuracy: outcome.best_accuracy,
        history: outcome.history,
    };
    let locations = persistence
        .save(&model, &request.output_filename, details)
        .await?;

    std::fs::write(CLOUD_PATH_FILE, &locations.cloud_path)
        .map_err(|e| JobError::StorageWrite(format!("{}: {}", CLOUD_PATH_FILE, e)))?;
    Ok(locations)
}

/// Splits the catalog, picks augmentation, batch size and imbalance handling,
/// then trains until a stop condition. The returned model holds the best weights.
pub async fn fine_tune<I: ImageSource>(
    training: &TrainingConfig,
    model: ModelState,
    catalog: &ClassCatalog,
    source: &I,
) -> Result<(ModelState, TrainingOutcome<Vec<(String, Tensor)>>), TrainError> {
    let class_names = catalog.class_names();
    let policy = AugmentationPolicy::for_dataset_size(catalog.total_samples(), training.random_erasing);
    let balance = ClassBalance::from_counts(&catalog.class_counts(), training.imbalance_ratio);
    if balance.imbalanced {
        log::info!(
            "Class imbalance ratio {:.2} exceeds {}, using weighted loss and sampling",
            balance.ratio,
            training.imbalance_ratio
        );
    }

    let mut rng = match training.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let samples = catalog.samples();
    let (train_indices, val_indices) = train_val_split(samples.len(), training.train_fraction, &mut rng);
    let pick = |indices: &[usize]| -> Vec<SampleRef> { indices.iter().map(|&i| samples[i].clone()).collect() };
    let batch_size = batch_size_for(train_indices.len());
    log::info!(
        "Split {} train / {} validation, batch size {}",
        train_indices.len(),
        val_indices.len(),
        batch_size
    );
    log::info!(
        "Target: {}, Patience: {}, LR: {}",
        training.target_accuracy,
        training.patience,
        training.learning_rate
    );

    let mut runner = TchRunner::new(TchRunnerParts {
        model,
        train: SampledDataset::new(source, pick(&train_indices), policy.train.clone(), &class_names),
        val: SampledDataset::new(source, pick(&val_indices), policy.eval.clone(), &class_names),
        class_weights: balance.imbalanced.then(|| balance.class_weights.clone()),
        batch_size,
        fetch_workers: training.fetch_workers,
        learning_rate: training.learning_rate,
        mixup_alpha: training.mixup_alpha,
        mixed_precision: training.mixed_precision,
        seed: training.seed.map(|seed| seed.wrapping_add(1)),
    })?;
    let outcome = TrainingLoop::new(training, &class_names).run(&mut runner).await?;
    Ok((runner.into_model(), outcome))
}

/// Resolve the weights, fetch the image and apply the confidence threshold.
pub async fn run_classification(config: &AppConfig, request: &ClassifyRequest) -> Result<ClassificationResult, JobError> {
    let factory = ModelFactory::for_architecture(request.architecture);
    let storage = S3Service::from_settings(&config.storage).await;
    let persistence = ModelPersistence::new(storage, &config.models_dir, &config.storage);
    let classifier = Classifier::load(
        &factory,
        request.num_classes,
        &persistence,
        &request.local_path,
        &request.cloud_path,
    )
    .await?;
    classifier
        .classify_url(&ImageFetcher::for_inference(), &request.image_url)
        .await
}
