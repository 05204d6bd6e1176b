use crate::blob_store::BlobStore;
use crate::error::StageError;
use crate::record::{MediaRecord, PathRole};
use crate::stage_chain::{Stage, StageContext, StageOutput};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Downloads the triggering object into its staging file
pub struct DownloadSource {
    blob_store: Arc<dyn BlobStore>,
}

impl DownloadSource {
    pub const NAME: &'static str = "download_source";

    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }
}

#[async_trait]
impl Stage for DownloadSource {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(
        &self,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        ctx.check_deadline(Self::NAME)?;
        let dest = record.require_local(PathRole::SourceFile)?;
        self.blob_store
            .download(record.bucket(), record.raw_key(), dest)
            .await?;
        Ok(StageOutput::done())
    }
}

/// Publishes the single tool output of a record
pub struct UploadOutput {
    blob_store: Arc<dyn BlobStore>,
}

impl UploadOutput {
    pub const NAME: &'static str = "upload_output";

    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }
}

#[async_trait]
impl Stage for UploadOutput {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(
        &self,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        ctx.check_deadline(Self::NAME)?;
        let src = record.require_local(PathRole::OutputFile)?;
        let key = record.require_remote(PathRole::OutputKey)?;
        let locator = record.require_remote(PathRole::OutputLocator)?.to_string();

        self.blob_store.upload(src, record.bucket(), key).await?;

        info!(locator = %locator, "Derivative published");
        record.artifacts.uploaded.push(locator);
        Ok(StageOutput::done())
    }
}
