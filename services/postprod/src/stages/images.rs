//! Article image stages: read the article, fetch the images it lists,
//! convert them and publish the converted files.
//!
//! Fetching is all-or-nothing. Conversion and upload succeed if at least
//! one image made it through.

use super::budgeted;
use crate::blob_store::{s3_locator, BlobStore};
use crate::config::{ProcessingConfig, ToolsConfig};
use crate::error::StageError;
use crate::image_fetcher::{image_file_name, ImageFetcher};
use crate::record::{MediaRecord, PathRole};
use crate::stage_chain::{Stage, StageContext, StageOutput};
use crate::tool_runner::{commands, ToolRunner};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Field of the article document listing its image URLs
pub const IMAGE_URLS_FIELD: &str = "ImagesURLs";

/// Downloads and parses the article document
pub struct DownloadArticle {
    blob_store: Arc<dyn BlobStore>,
}

impl DownloadArticle {
    pub const NAME: &'static str = "download_article";

    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }
}

#[async_trait]
impl Stage for DownloadArticle {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(
        &self,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        ctx.check_deadline(Self::NAME)?;
        let key = record.require_remote(PathRole::ArticleKey)?;
        let dest = record.require_local(PathRole::ArticleFile)?.to_path_buf();

        self.blob_store.download(record.bucket(), key, &dest).await?;

        let raw = tokio::fs::read(&dest)
            .await
            .map_err(|e| StageError::Article(format!("{}: {}", dest.display(), e)))?;
        let body: Value = serde_json::from_slice(&raw)
            .map_err(|e| StageError::Article(format!("invalid JSON: {}", e)))?;
        let urls = image_urls(&body)?;

        debug!(document_id = record.document_id().unwrap_or_default(), images = urls.len(), "Article read");
        record.artifacts.image_urls = Some(urls);
        record.artifacts.article_body = Some(body);
        Ok(StageOutput::done())
    }
}

fn image_urls(body: &Value) -> Result<Vec<String>, StageError> {
    let list = body
        .get(IMAGE_URLS_FIELD)
        .and_then(Value::as_array)
        .ok_or_else(|| StageError::Article(format!("no {} list", IMAGE_URLS_FIELD)))?;

    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| StageError::Article(format!("non-string entry in {}", IMAGE_URLS_FIELD)))
        })
        .collect()
}

/// Fetches the leading article images into the source staging directory
pub struct FetchImages {
    fetcher: Arc<dyn ImageFetcher>,
    max_images: usize,
}

impl FetchImages {
    pub const NAME: &'static str = "fetch_images";

    pub fn new(fetcher: Arc<dyn ImageFetcher>, processing: &ProcessingConfig) -> Self {
        Self {
            fetcher,
            max_images: processing.max_images,
        }
    }
}

#[async_trait]
impl Stage for FetchImages {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(
        &self,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let source_dir = record.require_local(PathRole::SourceDir)?.to_path_buf();
        let urls: Vec<String> = record
            .artifacts
            .image_urls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .take(self.max_images)
            .cloned()
            .collect();

        if urls.is_empty() {
            return Err(StageError::MissingInput("article lists no images".to_string()));
        }

        let names = local_names(&urls)?;
        let mut fetched = Vec::with_capacity(urls.len());
        for (url, name) in urls.iter().zip(names) {
            ctx.check_deadline(Self::NAME)?;
            let dest = source_dir.join(name);
            self.fetcher.fetch(url, &dest).await?;
            fetched.push(dest);
        }

        record.artifacts.source_images = fetched;
        Ok(StageOutput::done())
    }
}

/// Local file names for the fetched images. A name already taken by an
/// earlier image gets a numeric prefix, so no two images share a file or key.
fn local_names(urls: &[String]) -> Result<Vec<String>, StageError> {
    let mut taken = HashSet::new();
    urls.iter()
        .map(|url| {
            let name = image_file_name(url).ok_or_else(|| {
                StageError::Article(format!("image URL has no file name: {}", url))
            })?;
            let mut candidate = name.to_string();
            let mut n = 1;
            while !taken.insert(candidate.clone()) {
                candidate = format!("{}-{}", n, name);
                n += 1;
            }
            Ok(candidate)
        })
        .collect()
}

/// Converts each fetched image next to its source
pub struct ConvertImages {
    tool_runner: Arc<dyn ToolRunner>,
    ffmpeg: PathBuf,
}

impl ConvertImages {
    pub const NAME: &'static str = "convert_images";

    pub fn new(tool_runner: Arc<dyn ToolRunner>, tools: &ToolsConfig) -> Self {
        Self {
            tool_runner,
            ffmpeg: tools.ffmpeg_path.clone(),
        }
    }
}

#[async_trait]
impl Stage for ConvertImages {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(
        &self,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let mut converted = Vec::new();
        let mut last_error = None;

        for source in &record.artifacts.source_images {
            let invocation = budgeted(commands::convert_image(&self.ffmpeg, source), Self::NAME, ctx)?;
            match self.tool_runner.invoke(&invocation).await {
                Ok(output) => {
                    converted.push(output.artifact.unwrap_or_else(|| commands::converted_image_path(source)))
                }
                Err(e) => {
                    warn!(image = %source.display(), error = %e, "Image conversion failed");
                    last_error = Some(e);
                }
            }
        }

        if converted.is_empty() {
            return Err(match last_error {
                Some(e) => e.into(),
                None => StageError::MissingInput("no fetched images".to_string()),
            });
        }

        record.artifacts.converted_images = converted;
        Ok(StageOutput::done())
    }
}

/// Uploads converted images under the record's output prefix
pub struct UploadImages {
    blob_store: Arc<dyn BlobStore>,
}

impl UploadImages {
    pub const NAME: &'static str = "upload_images";

    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }
}

#[async_trait]
impl Stage for UploadImages {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(
        &self,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        ctx.check_deadline(Self::NAME)?;
        let prefix = record.require_remote(PathRole::OutputKey)?;
        let mut uploaded = Vec::new();
        let mut last_error = None;

        for image in &record.artifacts.converted_images {
            let Some(name) = image.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let key = format!("{}/{}", prefix, name);
            match self.blob_store.upload(image, record.bucket(), &key).await {
                Ok(()) => uploaded.push(s3_locator(record.bucket(), &key)),
                Err(e) => {
                    warn!(image = %image.display(), error = %e, "Image upload failed");
                    last_error = Some(e);
                }
            }
        }

        if uploaded.is_empty() {
            return Err(match last_error {
                Some(e) => e.into(),
                None => StageError::MissingInput("no converted images".to_string()),
            });
        }

        info!(
            document_id = record.document_id().unwrap_or_default(),
            images = uploaded.len(),
            "Article images published"
        );
        record.artifacts.uploaded.extend(uploaded);
        Ok(StageOutput::done())
    }
}
