use image::DynamicImage;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, StatusCode};
use std::time::Duration;
use url::Url;

/// Statuses treated as transient by the fetch retry loop.
pub const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

pub const INFERENCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid image URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("Unexpected content type '{content_type}' for {url}")]
    NotAnImage { content_type: String, url: String },
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Bounded exponential backoff for read-only GETs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        RETRY_STATUSES.contains(&status.as_u16())
    }

    /// Delay before attempt `attempt + 1`, doubling from the base delay.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// HTTP image source shared by the training dataset and the classifier.
#[derive(Clone)]
pub struct ImageFetcher {
    client: HttpClient,
    policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl ImageFetcher {
    /// Training throughput is not latency sensitive, so attempts never time out.
    pub fn for_training() -> Self {
        Self {
            client: HttpClient::new(),
            policy: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn for_inference() -> Self {
        Self {
            timeout: Some(INFERENCE_TIMEOUT),
            ..Self::for_training()
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Downloads and decodes an image, forcing it to 8-bit RGB.
    pub async fn fetch(&self, raw_url: &str) -> Result<DynamicImage, FetchError> {
        let (bytes, content_type) = self.fetch_bytes(raw_url).await?;
        decode_image(&bytes, &content_type, raw_url)
    }

    pub async fn fetch_bytes(&self, raw_url: &str) -> Result<(Vec<u8>, String), FetchError> {
        let url = parse_image_url(raw_url)?;
        let mut attempt = 1;
        loop {
            let mut request = self.client.get(url.clone());
            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let content_type = response
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let bytes = response.bytes().await?;
                        return Ok((bytes.to_vec(), content_type));
                    }
                    if self.policy.is_retryable_status(status) && self.policy.can_retry(attempt) {
                        self.backoff(attempt, raw_url, &status.to_string()).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        url: raw_url.to_string(),
                    });
                }
                Err(err) => {
                    if (err.is_connect() || err.is_timeout()) && self.policy.can_retry(attempt) {
                        self.backoff(attempt, raw_url, &err.to_string()).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Http(err));
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32, url: &str, cause: &str) {
        let delay = self.policy.delay_after(attempt);
        log::warn!(
            "Attempt {}/{} for {} failed ({}), retrying in {:?}",
            attempt,
            self.policy.max_attempts,
            url,
            cause,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

fn parse_image_url(raw_url: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw_url).map_err(|e| FetchError::InvalidUrl {
        url: raw_url.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchError::InvalidUrl {
            url: raw_url.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

/// Rejects non-image responses, then decodes and converts to three channels.
pub fn decode_image(bytes: &[u8], content_type: &str, url: &str) -> Result<DynamicImage, FetchError> {
    if !content_type.contains("image") {
        return Err(FetchError::NotAnImage {
            content_type: content_type.to_string(),
            url: url.to_string(),
        });
    }
    let image = image::load_from_memory(bytes)?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}
