//! Gated stage execution for a single record.
//!
//! A chain is an ordered list of stages. A stage runs its side effect only if
//! every gate before it is open; otherwise it is recorded as skipped. Gates
//! are sticky: once one closes, every later regular stage is skipped.
//! Finalization stages run regardless and decide for themselves what to do
//! with an upstream failure. Unrecognized records run nothing at all.
//!
//! Errors and panics never leave a stage: they become a failed gate.

use crate::error::{ParseError, StageError};
use crate::record::{MediaRecord, StageGates, StageResult};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What a successful stage hands back to the chain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    /// Named scalar measured by the stage
    pub metric: Option<(&'static str, f64)>,
}

impl StageOutput {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_metric(name: &'static str, value: f64) -> Self {
        Self {
            metric: Some((name, value)),
        }
    }
}

/// Per-batch execution context shared by every stage
#[derive(Debug, Clone)]
pub struct StageContext {
    deadline: Option<Instant>,
    min_tool_budget: Duration,
}

impl StageContext {
    pub fn new(deadline: Option<Instant>, min_tool_budget: Duration) -> Self {
        Self {
            deadline,
            min_tool_budget,
        }
    }

    /// Context without a deadline
    pub fn unbounded() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn min_tool_budget(&self) -> Duration {
        self.min_tool_budget
    }

    /// Time left before the batch deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Time budget for a long-running tool stage.
    ///
    /// Fails fast when less than the minimum tool budget remains, rather than
    /// starting work that would be cut off.
    pub fn tool_budget(&self, stage: &'static str) -> Result<Option<Duration>, StageError> {
        match self.remaining() {
            Some(remaining) if remaining < self.min_tool_budget || remaining.is_zero() => {
                Err(StageError::DeadlineExceeded { stage, remaining })
            }
            other => Ok(other),
        }
    }

    /// Refuse to start a transfer once the batch deadline has passed
    pub fn check_deadline(&self, stage: &'static str) -> Result<(), StageError> {
        match self.remaining() {
            Some(remaining) if remaining.is_zero() => {
                Err(StageError::DeadlineExceeded { stage, remaining })
            }
            _ => Ok(()),
        }
    }
}

/// One step of a record pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable stage name, used as the gate key
    fn name(&self) -> &'static str;

    /// Finalization stages run even when an upstream gate is closed
    fn always_runs(&self) -> bool {
        false
    }

    /// Perform the side effect
    async fn run(
        &self,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError>;
}

/// Ordered, gated sequence of stages
#[derive(Clone, Default)]
pub struct StageChain {
    stages: Vec<Arc<dyn Stage>>,
}

impl StageChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage
    pub fn then(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Drive a record through every stage and hand it back
    pub async fn execute(&self, mut record: MediaRecord, ctx: &StageContext) -> MediaRecord {
        record.gates = StageGates::new(self.stage_names());

        if !record.is_recognized() {
            let error = StageError::from(ParseError {
                key: record.raw_key().to_string(),
            });
            warn!(
                pipeline = %record.kind(),
                bucket = %record.bucket(),
                key = %record.raw_key(),
                "Skipping record with unrecognized key"
            );
            for (index, stage) in self.stages.iter().enumerate() {
                let result = if index == 0 {
                    StageResult::failed(&error)
                } else {
                    StageResult::Skipped
                };
                record.gates.set(stage.name(), result);
            }
            return record;
        }

        let mut upstream_open = true;

        for stage in &self.stages {
            let name = stage.name();

            let result = if upstream_open || stage.always_runs() {
                self.run_stage(stage.as_ref(), &mut record, ctx).await
            } else {
                debug!(stage = name, key = %record.raw_key(), "Stage skipped");
                StageResult::Skipped
            };

            upstream_open = upstream_open && result.passed();
            record.gates.set(name, result);
        }

        record
    }

    async fn run_stage(
        &self,
        stage: &dyn Stage,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> StageResult {
        let name = stage.name();

        let outcome = AssertUnwindSafe(stage.run(record, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(StageError::Panicked(panic_message(panic.as_ref()))));

        match outcome {
            Ok(output) => {
                let metric = output.metric.map(|(metric_name, value)| {
                    record.metrics.insert(metric_name, value);
                    value
                });
                debug!(stage = name, key = %record.raw_key(), "Stage succeeded");
                StageResult::Ok { metric }
            }
            Err(error) => {
                warn!(
                    stage = name,
                    pipeline = %record.kind(),
                    bucket = %record.bucket(),
                    key = %record.raw_key(),
                    document_id = record.document_id().unwrap_or_default(),
                    error = %error,
                    "Stage failed"
                );
                metrics::counter!("postprod.stage.failed", "stage" => name).increment(1);
                StageResult::failed(&error)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
