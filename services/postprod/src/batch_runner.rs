//! Batch execution.
//!
//! Records of a batch run concurrently, each on its own task, with at most
//! `max_concurrent_records` in flight. Results are collected in input order,
//! so index *i* of the response always describes entry *i* of the event. A
//! record that fails or panics only affects its own index.

use crate::config::{ProcessingConfig, ToolsConfig};
use crate::error::BatchError;
use crate::event::EventBatch;
use crate::pipeline::{Collaborators, RecordPipeline};
use crate::record::{PipelineKind, RecordOutcome};
use crate::stage_chain::StageContext;
use futures::{stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Batch report returned to the caller
#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: BatchBody,
}

/// Per-index outcome lists; exactly one of the two is set at every index
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchBody {
    #[serde(rename = "SuccessfulOps")]
    pub successful_ops: Vec<Option<RecordOutcome>>,
    #[serde(rename = "FailedOps")]
    pub failed_ops: Vec<Option<RecordOutcome>>,
}

impl BatchResponse {
    /// Split ordered outcomes into the two index-aligned lists.
    ///
    /// The status code is 200 even when every record failed; per-record
    /// failures are reported through `FailedOps` only.
    pub fn from_outcomes(outcomes: Vec<RecordOutcome>) -> Self {
        let mut body = BatchBody::default();
        for outcome in outcomes {
            if outcome.succeeded {
                body.successful_ops.push(Some(outcome));
                body.failed_ops.push(None);
            } else {
                body.successful_ops.push(None);
                body.failed_ops.push(Some(outcome));
            }
        }
        Self {
            status_code: 200,
            body,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.body.successful_ops.iter().flatten().count()
    }

    pub fn failed(&self) -> usize {
        self.body.failed_ops.iter().flatten().count()
    }
}

/// Runs event batches through the pipeline of their kind
pub struct BatchRunner {
    pipelines: HashMap<PipelineKind, Arc<RecordPipeline>>,
    max_concurrent_records: usize,
    batch_timeout: Duration,
    min_tool_budget: Duration,
}

impl BatchRunner {
    /// Runner with the standard pipeline for every kind
    pub fn new(
        collaborators: &Collaborators,
        tools: &ToolsConfig,
        processing: &ProcessingConfig,
    ) -> Self {
        let pipelines = PipelineKind::ALL
            .into_iter()
            .map(|kind| RecordPipeline::build(kind, collaborators, tools, processing));
        Self::with_pipelines(pipelines, processing)
    }

    /// Runner over an explicit set of pipelines
    pub fn with_pipelines(
        pipelines: impl IntoIterator<Item = RecordPipeline>,
        processing: &ProcessingConfig,
    ) -> Self {
        Self {
            pipelines: pipelines
                .into_iter()
                .map(|p| (p.kind(), Arc::new(p)))
                .collect(),
            max_concurrent_records: processing.max_concurrent_records.max(1),
            batch_timeout: processing.batch_timeout(),
            min_tool_budget: processing.min_tool_budget(),
        }
    }

    pub fn supports(&self, kind: PipelineKind) -> bool {
        self.pipelines.contains_key(&kind)
    }

    /// Run a batch with the configured batch timeout starting now
    pub async fn run(
        &self,
        kind: PipelineKind,
        batch: &EventBatch,
    ) -> Result<BatchResponse, BatchError> {
        self.run_until(kind, batch, Instant::now() + self.batch_timeout)
            .await
    }

    /// Run a batch against an explicit deadline
    #[instrument(
        skip(self, batch, deadline),
        fields(batch_id = %Uuid::new_v4(), pipeline = %kind, records = batch.len())
    )]
    pub async fn run_until(
        &self,
        kind: PipelineKind,
        batch: &EventBatch,
        deadline: Instant,
    ) -> Result<BatchResponse, BatchError> {
        let pipeline = self
            .pipelines
            .get(&kind)
            .cloned()
            .ok_or(BatchError::UnsupportedPipeline(kind))?;

        let started = Instant::now();
        let ctx = StageContext::new(Some(deadline), self.min_tool_budget);

        // Owned pairs keep the record futures free of borrows into `batch`
        let entries: Vec<(String, String)> = batch
            .records
            .iter()
            .map(|entry| (entry.bucket().to_string(), entry.key().to_string()))
            .collect();

        let outcomes: Vec<RecordOutcome> = stream::iter(entries.into_iter().map(|(bucket, key)| {
            let pipeline = pipeline.clone();
            let ctx = ctx.clone();

            async move {
                // Spawned lazily so only `max_concurrent_records` tasks exist at once
                let task = tokio::spawn({
                    let bucket = bucket.clone();
                    let key = key.clone();
                    async move { pipeline.run(&bucket, &key, &ctx).await.into_outcome() }
                });

                match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(bucket = %bucket, key = %key, error = %e, "Record task aborted");
                        RecordOutcome::crashed(kind, &bucket, &key, e.to_string())
                    }
                }
            }
        }))
        .buffered(self.max_concurrent_records)
        .collect()
        .await;

        let response = BatchResponse::from_outcomes(outcomes);
        let (succeeded, failed) = (response.succeeded(), response.failed());

        metrics::counter!("postprod.records.succeeded", "pipeline" => kind.as_str())
            .increment(succeeded as u64);
        metrics::counter!("postprod.records.failed", "pipeline" => kind.as_str())
            .increment(failed as u64);
        metrics::histogram!("postprod.batch.duration_seconds", "pipeline" => kind.as_str())
            .record(started.elapsed().as_secs_f64());

        info!(succeeded, failed, "Batch processed");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_parser::KeyParser;
    use crate::record::MediaRecord;
    use crate::stage_chain::{Stage, StageChain, StageOutput};
    use crate::error::StageError;
    use async_trait::async_trait;

    /// Fails records whose key contains "bad", panics on "boom"
    struct KeyDriven;

    #[async_trait]
    impl Stage for KeyDriven {
        fn name(&self) -> &'static str {
            "key_driven"
        }

        async fn run(
            &self,
            record: &mut MediaRecord,
            _ctx: &StageContext,
        ) -> Result<StageOutput, StageError> {
            if record.raw_key().contains("boom") {
                panic!("tool crashed");
            }
            if record.raw_key().contains("bad") {
                return Err(StageError::MissingInput("bad record".to_string()));
            }
            // Later records finish first
            if record.raw_key().contains("slow") {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(StageOutput::done())
        }
    }

    fn runner(max_concurrent_records: usize) -> BatchRunner {
        let processing = ProcessingConfig {
            max_concurrent_records,
            ..Default::default()
        };
        let pipeline = RecordPipeline::new(
            KeyParser::new(PipelineKind::Audio, "/tmp"),
            StageChain::new().then(KeyDriven),
        );
        BatchRunner::with_pipelines([pipeline], &processing)
    }

    fn batch(keys: &[&str]) -> EventBatch {
        EventBatch::from_keys("bucket", keys.iter().copied())
    }

    #[tokio::test]
    async fn test_outcomes_keep_input_order() {
        let response = runner(4)
            .run(
                PipelineKind::Audio,
                &batch(&[
                    "audio/full/slow-1/a.mp3",
                    "audio/full/bad-2/b.mp3",
                    "audio/full/fast-3/c.mp3",
                ]),
            )
            .await
            .unwrap();

        let body = &response.body;
        assert_eq!(body.successful_ops.len(), 3);
        assert_eq!(body.failed_ops.len(), 3);
        assert_eq!(
            body.successful_ops[0].as_ref().unwrap().key,
            "audio/full/slow-1/a.mp3"
        );
        assert!(body.successful_ops[1].is_none());
        assert_eq!(body.failed_ops[1].as_ref().unwrap().key, "audio/full/bad-2/b.mp3");
        assert_eq!(
            body.successful_ops[2].as_ref().unwrap().document_id.as_deref(),
            Some("fast-3")
        );
        for i in 0..3 {
            assert!(body.successful_ops[i].is_some() != body.failed_ops[i].is_some());
        }
    }

    #[tokio::test]
    async fn test_panicking_record_is_isolated() {
        let response = runner(2)
            .run(
                PipelineKind::Audio,
                &batch(&[
                    "audio/full/doc-1/a.mp3",
                    "audio/full/boom-2/b.mp3",
                    "audio/full/doc-3/c.mp3",
                ]),
            )
            .await
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.succeeded(), 2);
        assert_eq!(response.failed(), 1);
        assert!(response.body.failed_ops[1].is_some());
    }

    #[tokio::test]
    async fn test_all_failed_batch_still_reports_200() {
        let response = runner(1)
            .run(PipelineKind::Audio, &batch(&["random/junk/file.txt"]))
            .await
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.failed(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let response = runner(1)
            .run(PipelineKind::Audio, &EventBatch::default())
            .await
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert!(response.body.successful_ops.is_empty());
        assert!(response.body.failed_ops.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_pipeline_is_rejected() {
        let result = runner(1).run(PipelineKind::Image, &EventBatch::default()).await;
        assert_eq!(
            result.unwrap_err(),
            BatchError::UnsupportedPipeline(PipelineKind::Image)
        );
    }

    #[test]
    fn test_response_wire_format() {
        let response = BatchResponse::from_outcomes(vec![RecordOutcome::crashed(
            PipelineKind::Audio,
            "bucket",
            "k",
            "boom".to_string(),
        )]);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["statusCode"], 200);
        assert!(json["body"]["SuccessfulOps"][0].is_null());
        assert_eq!(json["body"]["FailedOps"][0]["key"], "k");
        assert_eq!(json["body"]["FailedOps"][0]["succeeded"], false);
    }
}
