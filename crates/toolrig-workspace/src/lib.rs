//! On-disk workspace state for toolrig provisioning runs.
//!
//! This crate owns everything a run leaves under the workspace root: the
//! `WorkspaceLayout` path scheme and its format version marker, structural
//! validity checks for fetched trees and design areas, move-aside of invalid
//! prior state, the append-only `RunLog`, and `StageStamps` recording which
//! host-level stages already completed.

pub mod layout;
pub mod runlog;
pub mod stamps;

pub use layout::{
    classify_design, classify_tree, move_aside, validate_design_id, TreeState, WorkspaceLayout,
    FETCH_MARKER, WORKSPACE_FORMAT_VERSION,
};
pub use runlog::RunLog;
pub use stamps::StageStamps;

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so a preceding `rename()` inside it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("workspace format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("invalid design identifier: {0}")]
    InvalidDesignId(String),
    #[error("cannot move aside '{path}': {reason}")]
    MoveAside { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_version_mismatch() {
        let e = WorkspaceError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        let msg = e.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn error_display_invalid_design_id() {
        let e = WorkspaceError::InvalidDesignId("bad/id".to_owned());
        assert!(e.to_string().contains("bad/id"));
    }

    #[test]
    fn error_display_move_aside() {
        let e = WorkspaceError::MoveAside {
            path: "/w/toolchain".to_owned(),
            reason: "no free suffix".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("/w/toolchain"));
        assert!(msg.contains("no free suffix"));
    }
}
