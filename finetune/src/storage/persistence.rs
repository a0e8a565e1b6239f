use std::ffi::OsString;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use shared::{EpochRecord, ModelMetadata, SavedLocations, StopReason};
use tch::{TchError, Tensor};
use uuid::Uuid;

use super::uri::{InvalidUri, StorageUri};
use super::{ObjectStore, StorageError, UploadOptions};
use crate::config::StorageSettings;
use crate::vision::{ModelError, ModelIdentity, ModelState};

const MODELS_PREFIX: &str = "models";
pub const METADATA_SUFFIX: &str = ".meta.json";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Invalid model file name '{0}'")]
    InvalidName(String),
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize weights: {0}")]
    Serialize(#[source] TchError),
    #[error("Failed to encode metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidUri(#[from] InvalidUri),
    #[error("Upload to {uri} failed: {source}")]
    Upload {
        uri: String,
        #[source]
        source: StorageError,
    },
    #[error("No usable weights. Cloud: {cloud}. Local: {local}")]
    Load { cloud: String, local: String },
}

impl PersistenceError {
    pub fn is_load_failure(&self) -> bool {
        matches!(self, PersistenceError::Load { .. })
    }
}

/// Why one weight source was rejected during `load`.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unreadable weights: {0}")]
    Decode(#[from] TchError),
    #[error("unreadable metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("weights are for {found_arch} with {found_classes} classes, expected {expected_arch} with {expected_classes}")]
    IdentityMismatch {
        expected_arch: shared::Architecture,
        expected_classes: usize,
        found_arch: shared::Architecture,
        found_classes: usize,
    },
    #[error("checksum mismatch (metadata {expected}, weights {found})")]
    Checksum { expected: String, found: String },
    #[error("{0}")]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSource {
    Cloud(StorageUri),
    Local(PathBuf),
}

impl fmt::Display for WeightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightSource::Cloud(uri) => write!(f, "{}", uri),
            WeightSource::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug)]
pub struct ModelLoad {
    pub source: WeightSource,
    pub metadata: Option<ModelMetadata>,
}

/// Training results that go into the metadata sidecar.
#[derive(Debug, Clone)]
pub struct RunDetails {
    pub class_names: Vec<String>,
    pub stop_reason: StopReason,
    pub best_val_accuracy: f64,
    pub history: Vec<EpochRecord>,
}

/// Saves trained weights to disk and the bucket, and resolves them back,
/// preferring the bucket copy.
pub struct ModelPersistence<S> {
    store: S,
    models_dir: PathBuf,
    bucket: String,
    scheme: String,
}

impl<S: ObjectStore> ModelPersistence<S> {
    pub fn new(store: S, models_dir: impl Into<PathBuf>, settings: &StorageSettings) -> Self {
        Self {
            store,
            models_dir: models_dir.into(),
            bucket: settings.bucket.clone(),
            scheme: settings.uri_scheme.clone(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cloud_uri(&self, destination_name: &str) -> Result<StorageUri, PersistenceError> {
        Ok(StorageUri::new(
            &self.scheme,
            &self.bucket,
            &format!("{}/{}", MODELS_PREFIX, destination_name),
        )?)
    }

    /// Both the local write and the upload must succeed.
    pub async fn save(
        &self,
        model: &ModelState,
        destination_name: &str,
        details: RunDetails,
    ) -> Result<SavedLocations, PersistenceError> {
        validate_name(destination_name)?;
        let weights = serialize_weights(model)?;
        let identity = model.identity();
        let metadata = ModelMetadata {
            run_id: Uuid::new_v4(),
            architecture: identity.architecture,
            num_classes: identity.num_classes,
            class_names: details.class_names,
            weights_sha256: sha256_hex(&weights),
            trained_at: Utc::now(),
            stop_reason: details.stop_reason,
            best_val_accuracy: details.best_val_accuracy,
            history: details.history,
        };
        let metadata_json = serde_json::to_vec_pretty(&metadata)?;

        std::fs::create_dir_all(&self.models_dir).map_err(|source| PersistenceError::Io {
            path: self.models_dir.clone(),
            source,
        })?;
        let local_path = self.models_dir.join(destination_name);
        log::info!("Saving model locally to {}", local_path.display());
        write_file(&local_path, &weights)?;
        write_file(&sidecar_path(&local_path), &metadata_json)?;

        let cloud = self.cloud_uri(destination_name)?;
        log::info!("Uploading {} bytes to {}", weights.len(), cloud);
        self.upload(&weights, &cloud, &UploadOptions::weights()).await?;
        self.upload(&metadata_json, &cloud.with_suffix(METADATA_SUFFIX), &UploadOptions::json())
            .await?;
        log::info!("Uploaded to {} (run {})", cloud, metadata.run_id);

        Ok(SavedLocations {
            local_path: local_path.display().to_string(),
            cloud_path: cloud.to_string(),
        })
    }

    /// Tries `cloud_path` first when it is a well-formed storage URI, then
    /// `local_path`. A source is accepted only when its weights load strictly
    /// into `skeleton`; failures are logged and the next source is tried.
    pub async fn load(
        &self,
        skeleton: &mut ModelState,
        local_path: &Path,
        cloud_path: &str,
    ) -> Result<ModelLoad, PersistenceError> {
        let cloud_failure = match StorageUri::parse(cloud_path) {
            Ok(uri) => match self.load_cloud(skeleton, &uri).await {
                Ok(metadata) => {
                    log::info!("Loaded weights from {}", uri);
                    return Ok(ModelLoad {
                        source: WeightSource::Cloud(uri),
                        metadata,
                    });
                }
                Err(err) => {
                    log::warn!("Cloud weights at {} unusable ({}), trying local", uri, err);
                    format!("{}: {}", uri, err)
                }
            },
            Err(err) => {
                log::info!("Skipping cloud load: {}", err);
                err.to_string()
            }
        };

        match self.load_local(skeleton, local_path) {
            Ok(metadata) => {
                log::info!("Loaded weights from {}", local_path.display());
                Ok(ModelLoad {
                    source: WeightSource::Local(local_path.to_path_buf()),
                    metadata,
                })
            }
            Err(err) => {
                log::error!("Local weights at {} unusable: {}", local_path.display(), err);
                Err(PersistenceError::Load {
                    cloud: cloud_failure,
                    local: format!("{}: {}", local_path.display(), err),
                })
            }
        }
    }

    async fn upload(&self, data: &[u8], uri: &StorageUri, options: &UploadOptions) -> Result<(), PersistenceError> {
        self.store
            .upload(data, uri, options)
            .await
            .map_err(|source| PersistenceError::Upload {
                uri: uri.to_string(),
                source,
            })
    }

    async fn load_cloud(&self, skeleton: &mut ModelState, uri: &StorageUri) -> Result<Option<ModelMetadata>, SourceError> {
        if !self.store.exists(uri).await? {
            return Err(SourceError::NotFound);
        }
        let weights = self.store.download(uri).await?;
        let sidecar = uri.with_suffix(METADATA_SUFFIX);
        let metadata = if self.store.exists(&sidecar).await? {
            Some(serde_json::from_slice(&self.store.download(&sidecar).await?)?)
        } else {
            None
        };
        apply_weights(skeleton, &weights, metadata)
    }

    fn load_local(&self, skeleton: &mut ModelState, path: &Path) -> Result<Option<ModelMetadata>, SourceError> {
        if !path.is_file() {
            return Err(SourceError::NotFound);
        }
        let weights = std::fs::read(path)?;
        let sidecar = sidecar_path(path);
        let metadata = if sidecar.is_file() {
            Some(serde_json::from_slice(&std::fs::read(&sidecar)?)?)
        } else {
            None
        };
        apply_weights(skeleton, &weights, metadata)
    }
}

fn validate_name(name: &str) -> Result<(), PersistenceError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." || trimmed.contains(['/', '\\']) {
        return Err(PersistenceError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), PersistenceError> {
    std::fs::write(path, data).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn sidecar_path(weights: &Path) -> PathBuf {
    let mut name = OsString::from(weights.as_os_str());
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn serialize_weights(model: &ModelState) -> Result<Vec<u8>, PersistenceError> {
    let named = model.named_weights();
    let mut buffer = Vec::new();
    Tensor::save_multi_to_stream(&named, &mut buffer).map_err(PersistenceError::Serialize)?;
    Ok(buffer)
}

/// Checks the sidecar (when present) against the skeleton and the bytes,
/// then copies the weights in.
fn apply_weights(
    skeleton: &mut ModelState,
    weights: &[u8],
    metadata: Option<ModelMetadata>,
) -> Result<Option<ModelMetadata>, SourceError> {
    if let Some(meta) = &metadata {
        verify_metadata(meta, skeleton.identity(), weights)?;
    }
    let named = Tensor::load_multi_from_stream(Cursor::new(weights))?;
    skeleton.load_named_weights(&named)?;
    Ok(metadata)
}

fn verify_metadata(meta: &ModelMetadata, identity: ModelIdentity, weights: &[u8]) -> Result<(), SourceError> {
    if meta.architecture != identity.architecture || meta.num_classes != identity.num_classes {
        return Err(SourceError::IdentityMismatch {
            expected_arch: identity.architecture,
            expected_classes: identity.num_classes,
            found_arch: meta.architecture,
            found_classes: meta.num_classes,
        });
    }
    let found = sha256_hex(weights);
    if !meta.weights_sha256.eq_ignore_ascii_case(&found) {
        return Err(SourceError::Checksum {
            expected: meta.weights_sha256.clone(),
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::vision::model::linear_test_model;

    const WEIGHTS_URI: &str = "s3://ptm_models/models/pets.ot";

    fn settings() -> StorageSettings {
        StorageSettings {
            bucket: "ptm_models".into(),
            uri_scheme: "s3".into(),
            region: None,
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
        }
    }

    fn details() -> RunDetails {
        RunDetails {
            class_names: vec!["cat".into(), "dog".into()],
            stop_reason: StopReason::TargetReached,
            best_val_accuracy: 0.97,
            history: Vec::new(),
        }
    }

    fn assert_same_weights(a: &ModelState, b: &ModelState) {
        for ((name, x), (_, y)) in a.named_weights().iter().zip(b.named_weights().iter()) {
            assert!(x.equal(y), "{name} differs");
        }
    }

    async fn saved() -> (tempfile::TempDir, ModelPersistence<MemoryStore>, ModelState, SavedLocations) {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ModelPersistence::new(MemoryStore::default(), dir.path().join("models"), &settings());
        let model = linear_test_model(2, 2);
        let locations = persistence.save(&model, "pets.ot", details()).await.unwrap();
        (dir, persistence, model, locations)
    }

    #[tokio::test]
    async fn save_writes_both_locations_and_sidecars() {
        let (dir, persistence, _model, locations) = saved().await;
        assert_eq!(locations.cloud_path, WEIGHTS_URI);
        assert_eq!(
            PathBuf::from(&locations.local_path),
            dir.path().join("models").join("pets.ot")
        );
        assert!(Path::new(&locations.local_path).is_file());
        assert!(Path::new(&format!("{}.meta.json", locations.local_path)).is_file());

        let weights = persistence.store().get(WEIGHTS_URI).unwrap();
        let sidecar = persistence
            .store()
            .get(&format!("{}.meta.json", WEIGHTS_URI))
            .unwrap();
        let meta: ModelMetadata = serde_json::from_slice(&sidecar).unwrap();
        assert_eq!(meta.class_names, vec!["cat", "dog"]);
        assert_eq!(meta.num_classes, 2);
        assert_eq!(meta.weights_sha256, sha256_hex(&weights));
    }

    #[tokio::test]
    async fn round_trip_restores_identical_weights_from_cloud() {
        let (_dir, persistence, model, locations) = saved().await;
        let mut skeleton = linear_test_model(2, 2);
        let loaded = persistence
            .load(&mut skeleton, Path::new(&locations.local_path), &locations.cloud_path)
            .await
            .unwrap();

        assert!(matches!(loaded.source, WeightSource::Cloud(_)));
        assert_eq!(loaded.metadata.unwrap().stop_reason, StopReason::TargetReached);
        assert_same_weights(&model, &skeleton);
    }

    #[tokio::test]
    async fn falls_back_to_local_when_cloud_object_is_gone() {
        let (_dir, persistence, model, locations) = saved().await;
        persistence.store().remove(WEIGHTS_URI);

        let mut skeleton = linear_test_model(2, 2);
        let loaded = persistence
            .load(&mut skeleton, Path::new(&locations.local_path), &locations.cloud_path)
            .await
            .unwrap();
        assert_eq!(loaded.source, WeightSource::Local(PathBuf::from(&locations.local_path)));
        assert_same_weights(&model, &skeleton);
    }

    #[tokio::test]
    async fn malformed_cloud_path_goes_straight_to_local() {
        let (_dir, persistence, _model, locations) = saved().await;
        let mut skeleton = linear_test_model(2, 2);
        let loaded = persistence
            .load(&mut skeleton, Path::new(&locations.local_path), "not a uri")
            .await
            .unwrap();
        assert!(matches!(loaded.source, WeightSource::Local(_)));
        assert_eq!(persistence.store().downloads.get(), 0);
    }

    #[tokio::test]
    async fn tampered_cloud_weights_fail_the_checksum() {
        let (_dir, persistence, _model, locations) = saved().await;
        let other = serialize_weights(&linear_test_model(2, 2)).unwrap();
        persistence.store().put(WEIGHTS_URI, other);

        let mut skeleton = linear_test_model(2, 2);
        let loaded = persistence
            .load(&mut skeleton, Path::new(&locations.local_path), &locations.cloud_path)
            .await
            .unwrap();
        assert!(matches!(loaded.source, WeightSource::Local(_)));
    }

    #[tokio::test]
    async fn mismatched_head_is_rejected_everywhere() {
        let (_dir, persistence, _model, locations) = saved().await;
        // Without sidecars the strict tensor check is what catches it.
        persistence.store().remove(&format!("{}.meta.json", WEIGHTS_URI));
        std::fs::remove_file(format!("{}.meta.json", locations.local_path)).unwrap();

        let mut skeleton = linear_test_model(2, 3);
        let err = persistence
            .load(&mut skeleton, Path::new(&locations.local_path), &locations.cloud_path)
            .await
            .unwrap_err();
        assert!(err.is_load_failure());
        let message = err.to_string();
        assert!(message.contains("shape"), "{message}");
        assert!(message.contains(WEIGHTS_URI), "{message}");
    }

    #[tokio::test]
    async fn missing_everywhere_reports_both_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = ModelPersistence::new(MemoryStore::default(), dir.path(), &settings());
        let mut skeleton = linear_test_model(2, 2);
        let err = persistence
            .load(&mut skeleton, &dir.path().join("absent.ot"), WEIGHTS_URI)
            .await
            .unwrap_err();
        match err {
            PersistenceError::Load { cloud, local } => {
                assert!(cloud.contains("not found"));
                assert!(local.contains("absent.ot"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn failed_upload_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        store.fail_uploads.set(true);
        let persistence = ModelPersistence::new(store, dir.path(), &settings());
        let err = persistence
            .save(&linear_test_model(2, 2), "pets.ot", details())
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Upload { .. }));
        assert!(!err.is_load_failure());
    }

    #[tokio::test]
    async fn path_like_names_are_refused() {
        let (_dir, persistence, model, _) = saved().await;
        for name in ["", "../escape.ot", "a/b.ot"] {
            assert!(matches!(
                persistence.save(&model, name, details()).await,
                Err(PersistenceError::InvalidName(_))
            ));
        }
    }
}
