use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_BUCKET: &str = "ptm_models";
const DEFAULT_TRAINING_CONFIG: &str = "config/training.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Cloudinary account used to list the per-class example images.
#[derive(Debug, Clone)]
pub struct CdnCredentials {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub bucket: String,
    pub uri_scheme: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

impl StorageSettings {
    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

/// Process-wide configuration, built once in `main` and passed by reference.
#[derive(Debug, Clone)]
pub struct AppConfig {
    cdn: Option<CdnCredentials>,
    pub storage: StorageSettings,
    pub models_dir: PathBuf,
    pub pretrained_dir: PathBuf,
    pub training: TrainingConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let cdn = match (
            first_env(&["CLOUDINARY_CLOUD_NAME", "CloudName"]),
            first_env(&["CLOUDINARY_API_KEY", "ApiKey"]),
            first_env(&["CLOUDINARY_API_SECRET", "ApiSecret"]),
        ) {
            (Some(cloud_name), Some(api_key), Some(api_secret)) => Some(CdnCredentials {
                cloud_name,
                api_key,
                api_secret,
            }),
            _ => None,
        };

        let uri_scheme = first_env(&["STORAGE_URI_SCHEME"]).unwrap_or_else(|| "s3".to_string());
        if !crate::storage::uri::SUPPORTED_SCHEMES.contains(&uri_scheme.as_str()) {
            return Err(ConfigError::Invalid {
                name: "STORAGE_URI_SCHEME",
                reason: format!("unsupported scheme '{}'", uri_scheme),
            });
        }

        let storage = StorageSettings {
            bucket: first_env(&["MODEL_BUCKET"]).unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            uri_scheme,
            region: first_env(&["AWS_REGION", "AWS_DEFAULT_REGION"]),
            endpoint_url: first_env(&["STORAGE_ENDPOINT_URL"]),
            access_key_id: first_env(&["AWS_ACCESS_KEY_ID"]),
            secret_access_key: first_env(&["AWS_SECRET_ACCESS_KEY"]),
            session_token: first_env(&["AWS_SESSION_TOKEN"]),
        };

        let training_path = first_env(&["TRAINING_CONFIG"]).map(PathBuf::from);
        let training = TrainingConfig::load(training_path.as_deref())?;

        Ok(Self {
            cdn,
            storage,
            models_dir: first_env(&["MODELS_DIR"])
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("models")),
            pretrained_dir: first_env(&["PRETRAINED_WEIGHTS_DIR"])
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("pretrained")),
            training,
        })
    }

    pub fn with_cdn(mut self, cdn: CdnCredentials) -> Self {
        self.cdn = Some(cdn);
        self
    }

    /// CDN credentials are only needed by the training job.
    pub fn cdn_credentials(&self) -> Result<&CdnCredentials, ConfigError> {
        self.cdn
            .as_ref()
            .ok_or_else(|| ConfigError::MissingVar("CLOUDINARY_CLOUD_NAME/API_KEY/API_SECRET".into()))
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

/// Hyperparameters of the adaptive training loop, optionally read from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub target_accuracy: f64,
    pub patience: usize,
    pub learning_rate: f64,
    pub lr_factor: f64,
    pub lr_patience: usize,
    pub lr_threshold: f64,
    pub min_lr: f64,
    pub train_fraction: f64,
    pub mixup_alpha: Option<f64>,
    /// Half-precision forward passes with loss scaling when training on CUDA.
    pub mixed_precision: bool,
    pub random_erasing: bool,
    pub imbalance_ratio: f64,
    /// Safety bound on the number of epochs. Unset means the loop only stops
    /// on the target accuracy or on early stopping.
    pub max_epochs: Option<usize>,
    pub fetch_workers: usize,
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            target_accuracy: 0.95,
            patience: 5,
            learning_rate: 0.001,
            lr_factor: 0.5,
            lr_patience: 3,
            lr_threshold: 1e-4,
            min_lr: 0.0,
            train_fraction: 0.8,
            mixup_alpha: Some(0.4),
            mixed_precision: true,
            random_erasing: false,
            imbalance_ratio: 1.5,
            max_epochs: None,
            fetch_workers: 4,
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// An explicit path must exist. Without one, `config/training.yaml` is used
    /// when present and the defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_TRAINING_CONFIG);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_yaml(&raw).map_err(|source| ConfigError::Yaml {
            path: path.clone(),
            source,
        })?;
        config.validate()?;
        log::info!("Loaded training config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.target_accuracy > 0.0 && self.target_accuracy <= 1.0) {
            return Err(invalid("target_accuracy", "must be in (0, 1]"));
        }
        if self.patience == 0 {
            return Err(invalid("patience", "must be at least 1"));
        }
        if self.learning_rate <= 0.0 {
            return Err(invalid("learning_rate", "must be positive"));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(invalid("lr_factor", "must be in (0, 1)"));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return Err(invalid("train_fraction", "must be in (0, 1)"));
        }
        if matches!(self.mixup_alpha, Some(alpha) if alpha <= 0.0) {
            return Err(invalid("mixup_alpha", "must be positive when set"));
        }
        if self.imbalance_ratio < 1.0 {
            return Err(invalid("imbalance_ratio", "must be at least 1"));
        }
        if self.max_epochs == Some(0) {
            return Err(invalid("max_epochs", "must be at least 1 when set"));
        }
        if self.fetch_workers == 0 {
            return Err(invalid("fetch_workers", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}
