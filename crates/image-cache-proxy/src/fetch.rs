//! Upstream image fetching and PNG re-encoding

use crate::error::{ProxyError, Result};
use image::{DynamicImage, ImageFormat};
use image_cache::CachedImage;
use reqwest::Client;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Parse a client-supplied image URL; only http(s) is fetched.
pub fn parse_image_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| ProxyError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ProxyError::InvalidUrl(format!(
            "unsupported scheme: {}",
            scheme
        ))),
    }
}

/// HTTP client for fetching images from their origin
pub struct ImageFetcher {
    client: Client,
}

impl ImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Fetch `url` and decode the body into pixels.
    pub async fn fetch(&self, url: &Url) -> Result<DynamicImage> {
        debug!(url = %url, "Fetching image from origin");

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), url = %url, "Origin refused image");
            return Err(ProxyError::Upstream(format!(
                "origin returned status {}",
                response.status()
            )));
        }

        let data = response.bytes().await?;
        debug!(url = %url, size = data.len(), "Fetched image");

        let image = tokio::task::spawn_blocking(move || image::load_from_memory(&data)).await??;
        Ok(image)
    }
}

/// Encode a cached image as PNG for the response body.
pub async fn encode_png(image: CachedImage) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    })
    .await?
}
