use crate::error::StageError;
use crate::record::{MediaRecord, PathRole};
use crate::stage_chain::{Stage, StageContext, StageOutput};
use async_trait::async_trait;
use tracing::debug;

/// Creates the record's source and output staging directories
pub struct CreateStagingDirs;

impl CreateStagingDirs {
    pub const NAME: &'static str = "create_staging";
}

#[async_trait]
impl Stage for CreateStagingDirs {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn run(
        &self,
        record: &mut MediaRecord,
        _ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        for role in [PathRole::SourceDir, PathRole::OutputDir] {
            let dir = record.require_local(role)?;
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StageError::Staging {
                    path: dir.to_path_buf(),
                    source,
                })?;
            debug!(dir = %dir.display(), "Staging directory ready");
        }
        Ok(StageOutput::done())
    }
}
