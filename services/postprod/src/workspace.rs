//! Per-record staging workspaces.
//!
//! Every record stages its files under a directory of its own below the
//! staging root. The directory is only planned here; the staging stage
//! creates it for recognized records. Dropping the workspace removes it, so
//! no file of one run is ever seen by another, and records of the same
//! document never share a path.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Staging directory owned by a single record
#[derive(Debug)]
pub struct RecordWorkspace {
    path: PathBuf,
}

impl RecordWorkspace {
    /// Plan a fresh workspace below `staging_root`
    pub fn new(staging_root: &Path) -> Self {
        Self {
            path: staging_root.join(format!("record-{}", Uuid::new_v4())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RecordWorkspace {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(workspace = %self.path.display(), "Record workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                workspace = %self.path.display(),
                error = %e,
                "Failed to remove record workspace"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspaces_are_distinct() {
        let a = RecordWorkspace::new(Path::new("/tmp/staging"));
        let b = RecordWorkspace::new(Path::new("/tmp/staging"));
        assert_ne!(a.path(), b.path());
        assert_eq!(a.path().parent(), Some(Path::new("/tmp/staging")));
    }

    #[test]
    fn test_drop_removes_contents() {
        let root = tempfile::tempdir().unwrap();
        let workspace = RecordWorkspace::new(root.path());
        let nested = workspace.path().join("audio/preview/doc-1");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("gen.wav"), b"RIFF").unwrap();

        drop(workspace);

        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_drop_without_directory_is_quiet() {
        let root = tempfile::tempdir().unwrap();
        drop(RecordWorkspace::new(root.path()));
        assert!(root.path().exists());
    }
}
