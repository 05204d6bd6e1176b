use super::budgeted;
use crate::config::{ProcessingConfig, ToolsConfig};
use crate::error::StageError;
use crate::record::{MediaRecord, PathRole, FULL_NARRATION_DURATION};
use crate::stage_chain::{Stage, StageContext, StageOutput};
use crate::tool_runner::{commands, ToolRunner};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Measures the full narration length
pub struct ProbeDuration {
    tool_runner: Arc<dyn ToolRunner>,
    ffprobe: PathBuf,
}

impl ProbeDuration {
    pub const NAME: &'static str = "probe_duration";

    pub fn new(tool_runner: Arc<dyn ToolRunner>, tools: &ToolsConfig) -> Self {
        Self {
            tool_runner,
            ffprobe: tools.ffprobe_path.clone(),
        }
    }
}

#[async_trait]
impl Stage for ProbeDuration {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(
        &self,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let input = record.require_local(PathRole::SourceFile)?;
        let invocation = budgeted(
            commands::probe_duration(&self.ffprobe, input),
            Self::NAME,
            ctx,
        )?;

        let output = self.tool_runner.invoke(&invocation).await?;
        let seconds = output.metric.ok_or_else(|| {
            StageError::MissingInput("duration missing from probe output".to_string())
        })?;

        info!(key = %record.raw_key(), seconds, "Narration measured");
        Ok(StageOutput::with_metric(FULL_NARRATION_DURATION, seconds))
    }
}

/// Cuts the preview clip and fades its tail
pub struct FadeOut {
    tool_runner: Arc<dyn ToolRunner>,
    ffmpeg: PathBuf,
    preview_secs: u32,
    fade_secs: u32,
}

impl FadeOut {
    pub const NAME: &'static str = "fade_out";

    pub fn new(
        tool_runner: Arc<dyn ToolRunner>,
        tools: &ToolsConfig,
        processing: &ProcessingConfig,
    ) -> Self {
        Self {
            tool_runner,
            ffmpeg: tools.ffmpeg_path.clone(),
            preview_secs: processing.preview_duration_secs,
            fade_secs: processing.fadeout_duration_secs,
        }
    }
}

#[async_trait]
impl Stage for FadeOut {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(
        &self,
        record: &mut MediaRecord,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let input = record.require_local(PathRole::SourceFile)?;
        let output = record.require_local(PathRole::OutputFile)?;
        let invocation = budgeted(
            commands::fade_out(&self.ffmpeg, input, output, self.preview_secs, self.fade_secs),
            Self::NAME,
            ctx,
        )?;

        self.tool_runner.invoke(&invocation).await?;
        Ok(StageOutput::done())
    }
}
