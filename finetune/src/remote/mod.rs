pub mod image_fetcher;

pub use image_fetcher::{FetchError, ImageFetcher, RetryPolicy};

use image::DynamicImage;

/// Anything that can turn a URL into a decoded RGB image.
#[allow(async_fn_in_trait)]
pub trait ImageSource {
    async fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError>;
}

impl ImageSource for ImageFetcher {
    async fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError> {
        self.fetch(url).await
    }
}
