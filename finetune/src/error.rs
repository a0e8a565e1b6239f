use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::remote::FetchError;
use crate::storage::persistence::PersistenceError;
use crate::training::TrainError;
use crate::vision::ModelError;

/// Job-level failure classes. Each binary prints one of these and exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Unsupported model architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("Insufficient data: class '{class}' has {found} images, at least {required} required")]
    InsufficientData {
        class: String,
        found: usize,
        required: usize,
    },
    #[error("Remote fetch failed: {0}")]
    RemoteFetch(String),
    #[error("Model load failed: {0}")]
    ModelLoad(String),
    #[error("Storage write failed: {0}")]
    StorageWrite(String),
    #[error("Training failed: {0}")]
    Training(String),
}

impl JobError {
    /// Configuration problems are detected before any remote work starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            JobError::Configuration(_) | JobError::UnsupportedArchitecture(_)
        )
    }
}

impl From<ConfigError> for JobError {
    fn from(err: ConfigError) -> Self {
        JobError::Configuration(err.to_string())
    }
}

impl From<CatalogError> for JobError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::InsufficientData {
                class,
                found,
                required,
            } => JobError::InsufficientData {
                class,
                found,
                required,
            },
            CatalogError::InvalidClassList(reason) => JobError::Configuration(reason),
            other => JobError::RemoteFetch(other.to_string()),
        }
    }
}

impl From<FetchError> for JobError {
    fn from(err: FetchError) -> Self {
        JobError::RemoteFetch(err.to_string())
    }
}

impl From<ModelError> for JobError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::UnsupportedArchitecture(name) => JobError::UnsupportedArchitecture(name),
            err @ (ModelError::PretrainedMissing { .. } | ModelError::InvalidClassCount(_)) => {
                JobError::Configuration(err.to_string())
            }
            other => JobError::Training(other.to_string()),
        }
    }
}

impl From<PersistenceError> for JobError {
    fn from(err: PersistenceError) -> Self {
        if err.is_load_failure() {
            JobError::ModelLoad(err.to_string())
        } else {
            JobError::StorageWrite(err.to_string())
        }
    }
}

impl From<TrainError> for JobError {
    fn from(err: TrainError) -> Self {
        match err {
            TrainError::Model(model) => model.into(),
            other => JobError::Training(other.to_string()),
        }
    }
}
