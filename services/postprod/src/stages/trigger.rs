use crate::blob_store::BlobStore;
use crate::error::{StageError, TransferError};
use crate::metadata_store::AttributeMap;
use crate::record::{MediaRecord, PathRole};
use crate::stage_chain::{Stage, StageContext, StageOutput};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Document that starts video rendering for an asset
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VideoTrigger<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub asset_id: &'a str,
    pub article_body: &'a serde_json::Value,
    pub metadata: &'a AttributeMap,
}

/// Writes the video trigger document and uploads it
pub struct PublishVideoTrigger {
    blob_store: Arc<dyn BlobStore>,
}

impl PublishVideoTrigger {
    pub const NAME: &'static str = "publish_video_trigger";

    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }
}

#[async_trait]
impl Stage for PublishVideoTrigger {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(
        &self,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        ctx.check_deadline(Self::NAME)?;
        let key = record.require_remote(PathRole::TriggerKey)?;
        let path = record.require_local(PathRole::TriggerFile)?;
        let trigger = VideoTrigger {
            bucket: record.bucket(),
            key,
            asset_id: &record.require_identity()?.document_id,
            article_body: record
                .artifacts
                .article_body
                .as_ref()
                .ok_or_else(|| StageError::MissingInput("article body".to_string()))?,
            metadata: record
                .artifacts
                .stored_metadata
                .as_ref()
                .ok_or_else(|| StageError::MissingInput("stored metadata".to_string()))?,
        };

        let body = serde_json::to_vec(&trigger)
            .map_err(|e| StageError::Article(format!("trigger document not encodable: {}", e)))?;
        tokio::fs::write(path, body)
            .await
            .map_err(|source| TransferError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        self.blob_store.upload(path, record.bucket(), key).await?;

        info!(
            asset_id = trigger.asset_id,
            locator = record.remote_path(PathRole::TriggerLocator).unwrap_or_default(),
            "Video pipeline triggered"
        );
        Ok(StageOutput::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MockBlobStore;
    use crate::key_parser::KeyParser;
    use crate::metadata_store::AttributeValue;
    use crate::record::PipelineKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_trigger_document_contents() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("output/doc-123")).unwrap();

        let mut blob_store = MockBlobStore::new();
        blob_store
            .expect_upload()
            .withf(|_, bucket, key| bucket == "bucket" && key == "video-trigger/doc-123")
            .times(1)
            .returning(|src, _, _| {
                let doc: serde_json::Value =
                    serde_json::from_slice(&std::fs::read(src).unwrap()).unwrap();
                assert_eq!(doc["Bucket"], "bucket");
                assert_eq!(doc["Key"], "video-trigger/doc-123");
                assert_eq!(doc["AssetId"], "doc-123");
                assert_eq!(doc["ArticleBody"]["Title"], "Headline");
                assert_eq!(doc["Metadata"]["AudioPreview"], "s3://bucket/a.wav");
                Ok(())
            });

        let mut record = KeyParser::new(PipelineKind::Image, root.path())
            .parse("bucket", "audio/preview/doc-123/gen.wav");
        record.artifacts.article_body = Some(json!({ "Title": "Headline" }));
        record.artifacts.stored_metadata = Some(AttributeMap::from([(
            "AudioPreview".to_string(),
            AttributeValue::from("s3://bucket/a.wav"),
        )]));

        PublishVideoTrigger::new(Arc::new(blob_store))
            .run(&mut record, &StageContext::unbounded())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_stored_metadata_fails() {
        let mut blob_store = MockBlobStore::new();
        blob_store.expect_upload().never();

        let mut record = KeyParser::new(PipelineKind::Image, "/tmp")
            .parse("bucket", "audio/preview/doc-123/gen.wav");
        record.artifacts.article_body = Some(json!({}));

        let result = PublishVideoTrigger::new(Arc::new(blob_store))
            .run(&mut record, &StageContext::unbounded())
            .await;
        assert!(matches!(result, Err(StageError::MissingInput(_))));
    }
}
