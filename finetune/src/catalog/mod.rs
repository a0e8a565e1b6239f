pub mod class_catalog;
pub mod cloudinary_service;

pub use class_catalog::{ClassCatalog, MIN_SAMPLES_PER_CLASS, parse_class_list};
pub use cloudinary_service::CloudinaryService;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("URL parsing failed: {0}")]
    Url(#[from] url::ParseError),
    #[error("Listing {prefix} returned HTTP {status}: {body}")]
    Status {
        prefix: String,
        status: u16,
        body: String,
    },
    #[error("Class {class} has insufficient images ({found} < {required})")]
    InsufficientData {
        class: String,
        found: usize,
        required: usize,
    },
    #[error("Invalid class list: {0}")]
    InvalidClassList(String),
}

/// One page of the CDN's resource listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct ResourcePage {
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Resource {
    pub secure_url: String,
}

/// Paginated prefix listing of uploaded images.
#[allow(async_fn_in_trait)]
pub trait ResourceLister {
    async fn list(
        &self,
        prefix: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<ResourcePage, CatalogError>;
}
