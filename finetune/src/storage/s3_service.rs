use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use std::future::Future;
use std::time::Duration;

use super::uri::StorageUri;
use super::{ObjectStore, StorageError, UploadOptions};
use crate::config::StorageSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// S3-compatible object store. A custom endpoint (for example the GCS
/// interoperability endpoint) switches to path-style addressing.
#[derive(Clone)]
pub struct S3Service {
    client: Client,
    request_timeout: Duration,
}

impl S3Service {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    pub async fn from_settings(settings: &StorageSettings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if !settings.has_static_credentials() {
            log::warn!("No static storage credentials set, using the default provider chain");
        }
        if let (Some(key_id), Some(secret)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                settings.session_token.clone(),
                None,
                "environment",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.endpoint_url.is_some())
            .build();
        Self::new(Client::from_conf(s3_config))
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        uri: &StorageUri,
        request: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(limit, request)
            .await
            .map_err(|_| StorageError::Timeout(limit, uri.to_string()))?
    }

    async fn put_single(
        &self,
        data: &[u8],
        uri: &StorageUri,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        let body = ByteStream::from(data.to_vec());
        let request = async {
            self.client
                .put_object()
                .bucket(uri.bucket())
                .key(uri.key())
                .body(body)
                .content_type(options.content_type)
                .send()
                .await
                .map_err(|e| StorageError::S3(DisplayErrorContext(&e).to_string()))?;
            Ok(())
        };
        self.bounded(options.chunk_timeout, uri, request).await
    }

    async fn put_multipart(
        &self,
        data: &[u8],
        uri: &StorageUri,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        let created = self
            .bounded(self.request_timeout, uri, async {
                self.client
                    .create_multipart_upload()
                    .bucket(uri.bucket())
                    .key(uri.key())
                    .content_type(options.content_type)
                    .send()
                    .await
                    .map_err(|e| StorageError::S3(DisplayErrorContext(&e).to_string()))
            })
            .await?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::S3(format!("No upload id returned for {}", uri)))?
            .to_string();

        match self.upload_parts(data, uri, &upload_id, options).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                self.bounded(self.request_timeout, uri, async {
                    self.client
                        .complete_multipart_upload()
                        .bucket(uri.bucket())
                        .key(uri.key())
                        .upload_id(&upload_id)
                        .multipart_upload(completed)
                        .send()
                        .await
                        .map_err(|e| StorageError::S3(DisplayErrorContext(&e).to_string()))
                })
                .await?;
                Ok(())
            }
            Err(err) => {
                log::warn!("Aborting multipart upload to {}: {}", uri, err);
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(uri.bucket())
                    .key(uri.key())
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    log::error!(
                        "Failed to abort multipart upload {}: {}",
                        upload_id,
                        DisplayErrorContext(&abort_err)
                    );
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        data: &[u8],
        uri: &StorageUri,
        upload_id: &str,
        options: &UploadOptions,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let total = data.len().div_ceil(options.chunk_size);
        let mut parts = Vec::with_capacity(total);

        for (index, chunk) in data.chunks(options.chunk_size).enumerate() {
            let part_number = (index + 1) as i32;
            let body = ByteStream::from(chunk.to_vec());
            let output = self
                .bounded(options.chunk_timeout, uri, async {
                    self.client
                        .upload_part()
                        .bucket(uri.bucket())
                        .key(uri.key())
                        .upload_id(upload_id)
                        .part_number(part_number)
                        .body(body)
                        .send()
                        .await
                        .map_err(|e| StorageError::S3(DisplayErrorContext(&e).to_string()))
                })
                .await?;
            log::debug!("Uploaded part {}/{} of {}", part_number, total, uri);
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }
        Ok(parts)
    }
}

impl ObjectStore for S3Service {
    async fn exists(&self, uri: &StorageUri) -> Result<bool, StorageError> {
        self.bounded(self.request_timeout, uri, async {
            match self
                .client
                .head_object()
                .bucket(uri.bucket())
                .key(uri.key())
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(err) => {
                    if err
                        .as_service_error()
                        .map(|e| e.is_not_found())
                        .unwrap_or(false)
                    {
                        Ok(false)
                    } else {
                        Err(StorageError::S3(DisplayErrorContext(&err).to_string()))
                    }
                }
            }
        })
        .await
    }

    async fn download(&self, uri: &StorageUri) -> Result<Vec<u8>, StorageError> {
        self.bounded(self.request_timeout, uri, async {
            let result = self
                .client
                .get_object()
                .bucket(uri.bucket())
                .key(uri.key())
                .send()
                .await
                .map_err(|err| {
                    if err
                        .as_service_error()
                        .map(|e| e.is_no_such_key())
                        .unwrap_or(false)
                    {
                        StorageError::NotFound(uri.to_string())
                    } else {
                        StorageError::S3(DisplayErrorContext(&err).to_string())
                    }
                })?;

            let body = result
                .body
                .collect()
                .await
                .map_err(|e| StorageError::S3(e.to_string()))?;
            Ok(body.into_bytes().to_vec())
        })
        .await
    }

    async fn upload(
        &self,
        data: &[u8],
        uri: &StorageUri,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        if data.len() <= options.chunk_size {
            self.put_single(data, uri, options).await
        } else {
            self.put_multipart(data, uri, options).await
        }
    }
}
