//! Concrete pipeline stages.
//!
//! Each stage reads the paths fixed by the key parser, performs one side
//! effect through an injected collaborator and leaves its products in the
//! record's artifacts for the stages after it.

mod audio;
mod images;
mod metadata;
mod staging;
mod transfer;
mod trigger;

pub use audio::{FadeOut, ProbeDuration};
pub use images::{ConvertImages, DownloadArticle, FetchImages, UploadImages};
pub use metadata::{MetadataPersister, PersistMetadata};
pub use staging::CreateStagingDirs;
pub use transfer::{DownloadSource, UploadOutput};
pub use trigger::PublishVideoTrigger;

use crate::error::StageError;
use crate::stage_chain::StageContext;
use crate::tool_runner::ToolInvocation;

/// Bind a tool invocation to the batch deadline, or fail fast.
///
/// The runner checks the minimum budget again once it holds a slot, since
/// waiting for one eats into the same deadline.
pub(crate) fn budgeted(
    invocation: ToolInvocation,
    stage: &'static str,
    ctx: &StageContext,
) -> Result<ToolInvocation, StageError> {
    ctx.tool_budget(stage)?;
    Ok(match ctx.deadline() {
        Some(deadline) => invocation.with_deadline(deadline, ctx.min_tool_budget()),
        None => invocation,
    })
}
