use reqwest::Client as HttpClient;
use std::time::Duration;
use url::Url;

use super::{CatalogError, ResourceLister, ResourcePage};
use crate::config::CdnCredentials;

const API_BASE: &str = "https://api.cloudinary.com/v1_1";
const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloudinary Admin API client, used only to list dataset image URLs.
#[derive(Clone)]
pub struct CloudinaryService {
    http_client: HttpClient,
    cloud_name: String,
    api_key: String,
    api_secret: String,
}

impl CloudinaryService {
    pub fn new(credentials: &CdnCredentials) -> Self {
        Self {
            http_client: HttpClient::new(),
            cloud_name: credentials.cloud_name.clone(),
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
        }
    }

    pub fn listing_url(
        &self,
        prefix: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<Url, CatalogError> {
        let mut url = Url::parse(&format!(
            "{}/{}/resources/image/upload",
            API_BASE, self.cloud_name
        ))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("prefix", prefix)
                .append_pair("max_results", &page_size.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("next_cursor", cursor);
            }
        }
        Ok(url)
    }
}

impl ResourceLister for CloudinaryService {
    async fn list(
        &self,
        prefix: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<ResourcePage, CatalogError> {
        let url = self.listing_url(prefix, page_size, cursor)?;
        let response = self
            .http_client
            .get(url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .timeout(LIST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("Cloudinary listing for {} failed: {} {}", prefix, status, body);
            return Err(CatalogError::Status {
                prefix: prefix.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<ResourcePage>().await?)
    }
}
