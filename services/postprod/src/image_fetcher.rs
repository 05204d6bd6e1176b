use crate::error::TransferError;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

/// Downloads images referenced by article documents
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download `url` into the local file `dest`
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), TransferError>;
}

/// HTTP image fetcher
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("postprod-service/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), TransferError> {
        let http_error = |message: String| TransferError::Http {
            url: url.to_string(),
            message,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| http_error(e.to_string()))?;

        let data = response
            .bytes()
            .await
            .map_err(|e| http_error(e.to_string()))?;

        tokio::fs::write(dest, &data)
            .await
            .map_err(|source| TransferError::Io {
                path: dest.to_path_buf(),
                source,
            })?;

        debug!(size_bytes = data.len(), "Image fetched");
        Ok(())
    }
}

/// Local file name for an image URL: its last path segment
pub fn image_file_name(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|name| {
        !name.is_empty() && *name != "." && *name != ".." && !name.contains(':')
    })
}
