//! Per-kind record pipelines: key parsing followed by a gated stage chain.

use crate::blob_store::BlobStore;
use crate::config::{ProcessingConfig, ToolsConfig};
use crate::image_fetcher::ImageFetcher;
use crate::key_parser::KeyParser;
use crate::metadata_store::MetadataStore;
use crate::record::{MediaRecord, PipelineKind};
use crate::stage_chain::{StageChain, StageContext};
use crate::stages::{
    ConvertImages, CreateStagingDirs, DownloadArticle, DownloadSource, FadeOut, FetchImages,
    PersistMetadata, ProbeDuration, PublishVideoTrigger, UploadImages, UploadOutput,
};
use crate::tool_runner::ToolRunner;
use crate::workspace::RecordWorkspace;
use std::sync::Arc;
use tracing::{debug, instrument};

/// External services the stages talk to
#[derive(Clone)]
pub struct Collaborators {
    pub blob_store: Arc<dyn BlobStore>,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub tool_runner: Arc<dyn ToolRunner>,
    pub image_fetcher: Arc<dyn ImageFetcher>,
}

/// Key parser and stage chain for one pipeline kind
#[derive(Clone)]
pub struct RecordPipeline {
    parser: KeyParser,
    chain: StageChain,
}

impl RecordPipeline {
    pub fn new(parser: KeyParser, chain: StageChain) -> Self {
        Self { parser, chain }
    }

    /// Assemble the standard chain for `kind`
    pub fn build(
        kind: PipelineKind,
        collaborators: &Collaborators,
        tools: &ToolsConfig,
        processing: &ProcessingConfig,
    ) -> Self {
        let c = collaborators;
        let chain = match kind {
            PipelineKind::Audio => StageChain::new()
                .then(CreateStagingDirs)
                .then(DownloadSource::new(c.blob_store.clone()))
                .then(ProbeDuration::new(c.tool_runner.clone(), tools))
                .then(FadeOut::new(c.tool_runner.clone(), tools, processing))
                .then(UploadOutput::new(c.blob_store.clone()))
                .then(PersistMetadata::new(c.metadata_store.clone())),
            PipelineKind::Image => StageChain::new()
                .then(CreateStagingDirs)
                .then(DownloadArticle::new(c.blob_store.clone()))
                .then(FetchImages::new(c.image_fetcher.clone(), processing))
                .then(ConvertImages::new(c.tool_runner.clone(), tools))
                .then(UploadImages::new(c.blob_store.clone()))
                .then(PersistMetadata::new(c.metadata_store.clone()))
                .then(PublishVideoTrigger::new(c.blob_store.clone())),
            PipelineKind::Finalize => {
                StageChain::new().then(PersistMetadata::new(c.metadata_store.clone()))
            }
        };

        Self::new(KeyParser::new(kind, processing.staging_root.clone()), chain)
    }

    pub fn kind(&self) -> PipelineKind {
        self.parser.kind()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.chain.stage_names()
    }

    /// Process one storage event end to end.
    ///
    /// The record stages its files in a workspace of its own, removed once
    /// the chain has finished.
    #[instrument(skip(self, ctx), fields(pipeline = %self.kind()))]
    pub async fn run(&self, bucket: &str, key: &str, ctx: &StageContext) -> MediaRecord {
        let workspace = RecordWorkspace::new(self.parser.staging_root());
        debug!(workspace = %workspace.path().display(), "Record workspace assigned");

        let record = self.parser.parse_in(workspace.path(), bucket, key);
        self.chain.execute(record, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MockBlobStore;
    use crate::image_fetcher::MockImageFetcher;
    use crate::metadata_store::MockMetadataStore;
    use crate::tool_runner::MockToolRunner;

    fn idle_collaborators() -> Collaborators {
        Collaborators {
            blob_store: Arc::new(MockBlobStore::new()),
            metadata_store: Arc::new(MockMetadataStore::new()),
            tool_runner: Arc::new(MockToolRunner::new()),
            image_fetcher: Arc::new(MockImageFetcher::new()),
        }
    }

    #[test]
    fn test_chain_layouts() {
        let c = idle_collaborators();
        let tools = ToolsConfig::default();
        let processing = ProcessingConfig::default();

        let audio = RecordPipeline::build(PipelineKind::Audio, &c, &tools, &processing);
        assert_eq!(
            audio.stage_names(),
            vec![
                "create_staging",
                "download_source",
                "probe_duration",
                "fade_out",
                "upload_output",
                "persist_metadata",
            ]
        );

        let image = RecordPipeline::build(PipelineKind::Image, &c, &tools, &processing);
        assert_eq!(image.stage_names().last(), Some(&"publish_video_trigger"));
        assert_eq!(image.kind(), PipelineKind::Image);

        let finalize = RecordPipeline::build(PipelineKind::Finalize, &c, &tools, &processing);
        assert_eq!(finalize.stage_names(), vec!["persist_metadata"]);
    }

    #[tokio::test]
    async fn test_unrecognized_key_touches_nothing() {
        // Mocks without expectations panic on any call
        let c = idle_collaborators();
        let root = tempfile::tempdir().unwrap();
        let processing = ProcessingConfig {
            staging_root: root.path().to_path_buf(),
            ..Default::default()
        };
        let pipeline =
            RecordPipeline::build(PipelineKind::Audio, &c, &ToolsConfig::default(), &processing);

        let record = pipeline
            .run("bucket", "random/junk/file.txt", &StageContext::unbounded())
            .await;

        assert!(!record.final_outcome());
        assert!(record.gates.iter().all(|e| !e.result.passed()));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_records_of_one_document_stage_apart() {
        let root = tempfile::tempdir().unwrap();
        let processing = ProcessingConfig {
            staging_root: root.path().to_path_buf(),
            ..Default::default()
        };
        let chain = StageChain::new().then(crate::stages::CreateStagingDirs);
        let pipeline = RecordPipeline::new(
            KeyParser::new(PipelineKind::Audio, processing.staging_root.clone()),
            chain,
        );

        let a = pipeline
            .run("bucket", "audio/full/doc-1/gen.mp3", &StageContext::unbounded())
            .await;
        let b = pipeline
            .run("bucket", "audio/full/doc-1/gen.mp3", &StageContext::unbounded())
            .await;

        assert!(a.final_outcome() && b.final_outcome());
        let (a_out, b_out) = (
            a.local_path(crate::record::PathRole::OutputFile).unwrap(),
            b.local_path(crate::record::PathRole::OutputFile).unwrap(),
        );
        assert_ne!(a_out, b_out);
        assert!(a_out.starts_with(root.path()));
        // Both workspaces are gone once their records finished
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
