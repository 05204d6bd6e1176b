use crate::config::S3Config;
use crate::error::TransferError;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use std::path::Path;
use tracing::{debug, info, instrument};

/// Object store used to fetch sources and publish derivatives
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Download `bucket/key` into the local file `dest`
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), TransferError>;

    /// Upload the local file `src` to `bucket/key`
    async fn upload(&self, src: &Path, bucket: &str, key: &str) -> Result<(), TransferError>;
}

/// S3-backed blob store
pub struct S3BlobStore {
    client: S3Client,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(region = %config.region, "S3 blob store initialized");

        Ok(Self { client })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    async fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), TransferError> {
        let download_error = |message: String| TransferError::Download {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| download_error(e.to_string()))?
            .into_bytes();

        tokio::fs::write(dest, &data)
            .await
            .map_err(|source| TransferError::Io {
                path: dest.to_path_buf(),
                source,
            })?;

        debug!(size_bytes = data.len(), "Object downloaded");
        Ok(())
    }

    #[instrument(skip(self, src), fields(src = %src.display()))]
    async fn upload(&self, src: &Path, bucket: &str, key: &str) -> Result<(), TransferError> {
        let upload_error = |message: String| TransferError::Upload {
            path: src.to_path_buf(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };

        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| upload_error(e.to_string()))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type(get_content_type(key))
            .send()
            .await
            .map_err(|e| upload_error(e.to_string()))?;

        debug!("Object uploaded");
        Ok(())
    }
}

/// Build the `s3://bucket/key` locator of an object
pub fn s3_locator(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}

/// Get content type from the extension of an object key
fn get_content_type(key: &str) -> &'static str {
    let extension = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "tga" => "image/x-tga",
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
