//! Per-record processing state.
//!
//! A [`MediaRecord`] is built once per event entry by the key parser, moved
//! through the stage chain, and folded into a [`RecordOutcome`] for the batch
//! report. Identifiers and paths are fixed at construction; stages only touch
//! gates, metrics and artifacts.

use crate::error::{ErrorKind, StageError};
use crate::metadata_store::AttributeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Metric name for the measured length of a full narration
pub const FULL_NARRATION_DURATION: &str = "full_narration_duration";

/// Pipeline variant a record is processed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Full narration → faded preview clip
    Audio,
    /// Narration preview → article images → video trigger
    Image,
    /// Rendered video outputs → metadata
    Finalize,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 3] = [
        PipelineKind::Audio,
        PipelineKind::Image,
        PipelineKind::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Audio => "audio",
            PipelineKind::Image => "image",
            PipelineKind::Finalize => "finalize",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(PipelineKind::Audio),
            "image" | "images" => Ok(PipelineKind::Image),
            "finalize" | "video" => Ok(PipelineKind::Finalize),
            other => Err(format!("unknown pipeline: {}", other)),
        }
    }
}

/// Identifiers derived from a recognized storage key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaIdentity {
    /// Logical asset identifier used as the metadata store key
    pub document_id: String,
    /// First key segment (`audio`, `output`)
    pub media_type: String,
    /// Layout variant (`full`, `preview`)
    pub media_format: String,
    /// Last key segment
    pub file_name: String,
    /// File name without its extension
    pub file_stem: String,
    /// Text after the last `.` of the file name, empty if there is none
    pub extension: String,
}

/// Named path roles computed by the key parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRole {
    /// Staging directory holding downloaded inputs
    SourceDir,
    /// Staging directory holding tool outputs
    OutputDir,
    /// Local copy of the triggering object
    SourceFile,
    /// Local tool output
    OutputFile,
    /// Local copy of the article document
    ArticleFile,
    /// Local video trigger document
    TriggerFile,
    /// Locator of the triggering object
    SourceLocator,
    /// Object key (or key prefix) the derivative is published under
    OutputKey,
    /// Locator of the published derivative
    OutputLocator,
    /// Object key of the article document
    ArticleKey,
    /// Object key of the video trigger document
    TriggerKey,
    /// Locator of the video trigger document
    TriggerLocator,
}

/// Result of one stage on one record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageResult {
    /// Not reached yet
    Pending,
    /// Side effect confirmed
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        metric: Option<f64>,
    },
    /// Not run because an upstream gate is closed
    Skipped,
    /// Side effect attempted and failed
    Failed { kind: ErrorKind, reason: String },
}

impl StageResult {
    pub fn failed(error: &StageError) -> Self {
        StageResult::Failed {
            kind: error.kind(),
            reason: error.to_string(),
        }
    }

    /// Gate value: true only on confirmed success
    pub fn passed(&self) -> bool {
        matches!(self, StageResult::Ok { .. })
    }
}

/// One gate of the ordered gate list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageEntry {
    pub stage: &'static str,
    #[serde(flatten)]
    pub result: StageResult,
}

/// Ordered mapping from stage name to stage result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StageGates {
    entries: Vec<StageEntry>,
}

impl StageGates {
    /// Gates for the given stages, all closed
    pub fn new(stages: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            entries: stages
                .into_iter()
                .map(|stage| StageEntry {
                    stage,
                    result: StageResult::Pending,
                })
                .collect(),
        }
    }

    /// Record the result of a stage
    pub fn set(&mut self, stage: &'static str, result: StageResult) {
        match self.entries.iter_mut().find(|e| e.stage == stage) {
            Some(entry) => entry.result = result,
            None => self.entries.push(StageEntry { stage, result }),
        }
    }

    pub fn result(&self, stage: &str) -> Option<&StageResult> {
        self.entries
            .iter()
            .find(|e| e.stage == stage)
            .map(|e| &e.result)
    }

    /// Gate value of a stage; unknown stages are closed
    pub fn gate(&self, stage: &str) -> bool {
        self.result(stage).map(StageResult::passed).unwrap_or(false)
    }

    /// True if every stage ordered before `stage` passed
    pub fn passed_before(&self, stage: &str) -> bool {
        self.entries
            .iter()
            .take_while(|e| e.stage != stage)
            .all(|e| e.result.passed())
    }

    /// AND over all gates; an empty gate list is not a success
    pub fn all_passed(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(|e| e.result.passed())
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scalar values measured by stages
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExtractedMetrics(BTreeMap<String, f64>);

impl ExtractedMetrics {
    pub fn insert(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Outputs produced by stages and consumed downstream
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    /// Parsed article document
    pub article_body: Option<serde_json::Value>,
    /// Image URLs listed in the article
    pub image_urls: Option<Vec<String>>,
    /// Downloaded article images
    pub source_images: Vec<PathBuf>,
    /// Successfully converted images
    pub converted_images: Vec<PathBuf>,
    /// Locators of uploaded derivatives
    pub uploaded: Vec<String>,
    /// Attribute set returned by the metadata store
    pub stored_metadata: Option<AttributeMap>,
}

/// Transient computation context for one event entry
#[derive(Debug, Clone)]
pub struct MediaRecord {
    kind: PipelineKind,
    bucket: String,
    raw_key: String,
    identity: Option<MediaIdentity>,
    local_paths: BTreeMap<PathRole, PathBuf>,
    remote_paths: BTreeMap<PathRole, String>,
    pub gates: StageGates,
    pub metrics: ExtractedMetrics,
    pub artifacts: Artifacts,
}

impl MediaRecord {
    pub(crate) fn recognized(
        kind: PipelineKind,
        bucket: &str,
        raw_key: &str,
        identity: MediaIdentity,
        local_paths: BTreeMap<PathRole, PathBuf>,
        remote_paths: BTreeMap<PathRole, String>,
    ) -> Self {
        Self {
            kind,
            bucket: bucket.to_string(),
            raw_key: raw_key.to_string(),
            identity: Some(identity),
            local_paths,
            remote_paths,
            gates: StageGates::default(),
            metrics: ExtractedMetrics::default(),
            artifacts: Artifacts::default(),
        }
    }

    pub(crate) fn unrecognized(kind: PipelineKind, bucket: &str, raw_key: &str) -> Self {
        Self {
            kind,
            bucket: bucket.to_string(),
            raw_key: raw_key.to_string(),
            identity: None,
            local_paths: BTreeMap::new(),
            remote_paths: BTreeMap::new(),
            gates: StageGates::default(),
            metrics: ExtractedMetrics::default(),
            artifacts: Artifacts::default(),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn raw_key(&self) -> &str {
        &self.raw_key
    }

    pub fn identity(&self) -> Option<&MediaIdentity> {
        self.identity.as_ref()
    }

    pub fn document_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.document_id.as_str())
    }

    pub fn is_recognized(&self) -> bool {
        self.identity.is_some()
    }

    pub fn local_path(&self, role: PathRole) -> Option<&Path> {
        self.local_paths.get(&role).map(PathBuf::as_path)
    }

    pub fn remote_path(&self, role: PathRole) -> Option<&str> {
        self.remote_paths.get(&role).map(String::as_str)
    }

    pub fn local_paths(&self) -> &BTreeMap<PathRole, PathBuf> {
        &self.local_paths
    }

    pub fn remote_paths(&self) -> &BTreeMap<PathRole, String> {
        &self.remote_paths
    }

    /// Local path a stage cannot run without
    pub fn require_local(&self, role: PathRole) -> Result<&Path, StageError> {
        self.local_path(role)
            .ok_or_else(|| StageError::MissingInput(format!("local path {:?}", role)))
    }

    /// Remote path a stage cannot run without
    pub fn require_remote(&self, role: PathRole) -> Result<&str, StageError> {
        self.remote_path(role)
            .ok_or_else(|| StageError::MissingInput(format!("remote path {:?}", role)))
    }

    /// Identity a stage cannot run without
    pub fn require_identity(&self) -> Result<&MediaIdentity, StageError> {
        self.identity
            .as_ref()
            .ok_or_else(|| StageError::MissingInput("document identifier".to_string()))
    }

    /// Logical AND over every stage gate
    pub fn final_outcome(&self) -> bool {
        self.gates.all_passed()
    }

    /// Fold the record into its reportable terminal state
    pub fn into_outcome(self) -> RecordOutcome {
        let succeeded = self.final_outcome();
        RecordOutcome {
            pipeline: self.kind,
            bucket: self.bucket,
            key: self.raw_key,
            document_id: self.identity.map(|i| i.document_id),
            succeeded,
            stages: self.gates.iter().cloned().collect(),
            metrics: self.metrics,
            locators: self
                .remote_paths
                .into_iter()
                .filter(|(role, _)| {
                    matches!(
                        role,
                        PathRole::SourceLocator | PathRole::OutputLocator | PathRole::TriggerLocator
                    )
                })
                .collect(),
            uploaded: self.artifacts.uploaded,
            completed_at: Utc::now(),
        }
    }
}

/// Terminal state of one record as reported to callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub pipeline: PipelineKind,
    pub bucket: String,
    pub key: String,
    pub document_id: Option<String>,
    pub succeeded: bool,
    pub stages: Vec<StageEntry>,
    pub metrics: ExtractedMetrics,
    pub locators: BTreeMap<PathRole, String>,
    pub uploaded: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl RecordOutcome {
    /// Outcome for a record whose task died before producing a record
    pub fn crashed(kind: PipelineKind, bucket: &str, key: &str, reason: String) -> Self {
        Self {
            pipeline: kind,
            bucket: bucket.to_string(),
            key: key.to_string(),
            document_id: None,
            succeeded: false,
            stages: vec![StageEntry {
                stage: "record",
                result: StageResult::Failed {
                    kind: ErrorKind::Panic,
                    reason,
                },
            }],
            metrics: ExtractedMetrics::default(),
            locators: BTreeMap::new(),
            uploaded: Vec::new(),
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_gates_are_closed() {
        let gates = StageGates::new(["a", "b", "c"]);
        assert_eq!(gates.len(), 3);
        assert!(gates.iter().all(|e| e.result == StageResult::Pending));
        assert!(!gates.gate("a"));
        assert!(!gates.all_passed());
    }

    #[test]
    fn test_passed_before_only_looks_upstream() {
        let mut gates = StageGates::new(["a", "b", "c"]);
        gates.set("a", StageResult::Ok { metric: None });
        assert!(gates.passed_before("b"));
        assert!(!gates.passed_before("c"));

        gates.set("b", StageResult::Skipped);
        assert!(!gates.passed_before("c"));
        assert!(gates.passed_before("a"));
    }

    #[test]
    fn test_empty_gates_are_not_a_success() {
        assert!(!StageGates::default().all_passed());
    }

    #[test]
    fn test_pipeline_kind_parsing() {
        assert_eq!("audio".parse::<PipelineKind>(), Ok(PipelineKind::Audio));
        assert_eq!("images".parse::<PipelineKind>(), Ok(PipelineKind::Image));
        assert_eq!("finalize".parse::<PipelineKind>(), Ok(PipelineKind::Finalize));
        assert!("thumbnail".parse::<PipelineKind>().is_err());
    }

    #[test]
    fn test_stage_entry_serialization() {
        let entry = StageEntry {
            stage: "probe_duration",
            result: StageResult::Ok { metric: Some(42.5) },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["stage"], "probe_duration");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["metric"], 42.5);

        let entry = StageEntry {
            stage: "upload",
            result: StageResult::Failed {
                kind: ErrorKind::Transfer,
                reason: "denied".to_string(),
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "transfer");
    }
}
