use crate::error::StageError;
use crate::metadata_store::{AttributeMap, AttributeValue, MetadataStore, FAILED_SENTINEL};
use crate::record::{MediaRecord, PathRole, PipelineKind, FULL_NARRATION_DURATION};
use crate::stage_chain::{Stage, StageContext, StageOutput};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument};

pub const FULL_NARRATION: &str = "FullNarration";
pub const AUDIO_PREVIEW: &str = "AudioPreview";
pub const FULL_NARRATION_DURATION_SECS: &str = "FullNarrationDurationInSeconds";
pub const IMAGES_URLS: &str = "ImagesURLs";
pub const POST_PRODUCED_IMAGES: &str = "PostProducedImagesS3Paths";
pub const PREVIEW_VIDEO_FILE: &str = "PreviewVideoFile";
pub const FULL_VIDEO_STREAM: &str = "FullVideoStream";

/// Maps record state to the attributes stored for its asset.
///
/// The mapping is a pure function of the record, so re-processing the same
/// event rewrites the same values.
pub struct MetadataPersister;

impl MetadataPersister {
    pub fn attributes(
        record: &MediaRecord,
        upstream_succeeded: bool,
    ) -> Result<AttributeMap, StageError> {
        let identity = record.require_identity()?;
        let mut attributes = AttributeMap::new();

        match record.kind() {
            PipelineKind::Audio => {
                attributes.insert(
                    FULL_NARRATION.to_string(),
                    record.require_remote(PathRole::SourceLocator)?.into(),
                );
                let preview = if upstream_succeeded {
                    record.require_remote(PathRole::OutputLocator)?
                } else {
                    FAILED_SENTINEL
                };
                attributes.insert(AUDIO_PREVIEW.to_string(), preview.into());
                if let Some(seconds) = record.metrics.get(FULL_NARRATION_DURATION) {
                    attributes.insert(FULL_NARRATION_DURATION_SECS.to_string(), seconds.into());
                }
            }
            PipelineKind::Image => {
                if let Some(urls) = &record.artifacts.image_urls {
                    attributes.insert(IMAGES_URLS.to_string(), urls.clone().into());
                }
                let images = if upstream_succeeded {
                    AttributeValue::List(record.artifacts.uploaded.clone())
                } else {
                    FAILED_SENTINEL.into()
                };
                attributes.insert(POST_PRODUCED_IMAGES.to_string(), images);
            }
            PipelineKind::Finalize => {
                let name = match identity.media_format.as_str() {
                    "preview" => PREVIEW_VIDEO_FILE,
                    _ => FULL_VIDEO_STREAM,
                };
                attributes.insert(
                    name.to_string(),
                    record.require_remote(PathRole::SourceLocator)?.into(),
                );
            }
        }

        Ok(attributes)
    }
}

/// Writes the record's attributes to the metadata store; runs after any
/// upstream failure so the failure itself is recorded
pub struct PersistMetadata {
    store: Arc<dyn MetadataStore>,
}

impl PersistMetadata {
    pub const NAME: &'static str = "persist_metadata";

    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for PersistMetadata {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn always_runs(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(key = %record.raw_key()))]
    async fn run(
        &self,
        record: &mut MediaRecord,
        _ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let upstream_succeeded = record.gates.passed_before(Self::NAME);
        let attributes = MetadataPersister::attributes(record, upstream_succeeded)?;
        let asset_id = record.require_identity()?.document_id.clone();

        let stored = self.store.update_attributes(&asset_id, attributes).await?;

        info!(
            asset_id = %asset_id,
            upstream_succeeded,
            attributes = stored.len(),
            "Metadata persisted"
        );
        record.artifacts.stored_metadata = Some(stored);
        Ok(StageOutput::done())
    }
}
