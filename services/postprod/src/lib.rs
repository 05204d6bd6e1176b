//! Post-production service
//!
//! Media post-production for narrated articles. The service consumes batches
//! of object-storage events, derives each object's asset identity from its
//! key, runs a fixed chain of processing stages per record and records the
//! outcome as asset metadata.
//!
//! ## Pipelines
//!
//! - **Audio**: full narration → probed duration and a faded preview clip
//! - **Image**: narration preview → article images fetched, converted and
//!   published, then a video rendering trigger
//! - **Finalize**: rendered preview video or HLS stream → asset metadata
//!
//! Every stage is gated on the ones before it. Metadata persistence always
//! runs so that failures are recorded as a `FAILED` sentinel.
//!
//! ## Architecture
//!
//! ```text
//! Kafka topics / HTTP          BatchRunner                Collaborators
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Storage      │           │ Key Parser   │          │ S3           │
//! │ Event        │──────────▶│      │       │─────────▶│ ffmpeg       │
//! │ Batches      │           │      ▼       │          │ HTTP images  │
//! └──────────────┘           │ Stage Chain  │          │ PostgreSQL   │
//!        ▲                   └──────────────┘          └──────────────┘
//!        │                          │
//!        │                          ▼
//!        │                   ┌──────────────┐
//!        └───────────────────│ Batch        │
//!                            │ Response     │
//!                            └──────────────┘
//! ```

pub mod api;
pub mod batch_runner;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod event;
pub mod image_fetcher;
pub mod kafka_consumer;
pub mod key_parser;
pub mod metadata_store;
pub mod pipeline;
pub mod record;
pub mod stage_chain;
pub mod stages;
pub mod tool_runner;
pub mod workspace;

pub use api::AppState;
pub use batch_runner::{BatchBody, BatchResponse, BatchRunner};
pub use blob_store::{BlobStore, S3BlobStore};
pub use config::Config;
pub use error::{BatchError, ErrorKind, StageError};
pub use event::{EventBatch, EventRecord};
pub use image_fetcher::{HttpImageFetcher, ImageFetcher};
pub use kafka_consumer::BatchKafkaConsumer;
pub use key_parser::KeyParser;
pub use metadata_store::{AttributeMap, AttributeValue, MetadataStore, PgMetadataStore};
pub use pipeline::{Collaborators, RecordPipeline};
pub use record::{MediaRecord, PipelineKind, RecordOutcome, StageResult};
pub use stage_chain::{Stage, StageChain, StageContext, StageOutput};
pub use tool_runner::{ProcessToolRunner, ToolInvocation, ToolOutput, ToolRunner};
pub use workspace::RecordWorkspace;
