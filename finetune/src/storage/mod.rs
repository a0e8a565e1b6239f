pub mod persistence;
pub mod s3_service;
pub mod uri;

#[cfg(test)]
pub(crate) mod memory;

use std::time::Duration;

use uri::{InvalidUri, StorageUri};

pub use persistence::ModelPersistence;
pub use s3_service::S3Service;

/// Large weight files go up in 5 MiB parts, each allowed up to five minutes.
pub const UPLOAD_CHUNK_SIZE: usize = 5 * 1024 * 1024;
pub const UPLOAD_CHUNK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Timed out after {0:?} on {1}")]
    Timeout(Duration, String),
    #[error(transparent)]
    InvalidUri(#[from] InvalidUri),
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: usize,
    pub chunk_timeout: Duration,
    pub content_type: &'static str,
}

impl UploadOptions {
    pub fn weights() -> Self {
        Self {
            chunk_size: UPLOAD_CHUNK_SIZE,
            chunk_timeout: UPLOAD_CHUNK_TIMEOUT,
            content_type: "application/octet-stream",
        }
    }

    pub fn json() -> Self {
        Self {
            content_type: "application/json",
            ..Self::weights()
        }
    }
}

/// Byte-blob access to the bucket holding trained models.
#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    async fn exists(&self, uri: &StorageUri) -> Result<bool, StorageError>;

    async fn download(&self, uri: &StorageUri) -> Result<Vec<u8>, StorageError>;

    async fn upload(
        &self,
        data: &[u8],
        uri: &StorageUri,
        options: &UploadOptions,
    ) -> Result<(), StorageError>;
}
