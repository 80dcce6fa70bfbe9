use crate::layout::WorkspaceLayout;
use crate::WorkspaceError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Completion stamp for a stage whose effect lives on the host rather than
/// inside the workspace (package index, auxiliary packages).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stamp {
    pub stage: String,
    pub completed_at: String,
}

#[derive(Debug, Clone)]
pub struct StageStamps {
    dir: PathBuf,
}

impl StageStamps {
    pub fn new(layout: &WorkspaceLayout) -> Self {
        Self {
            dir: layout.stamps_dir(),
        }
    }

    fn path(&self, stage: &str) -> PathBuf {
        self.dir.join(stage)
    }

    pub fn has(&self, stage: &str) -> bool {
        self.get(stage).is_some()
    }

    /// A stamp that fails to parse counts as absent, so a half-written stamp
    /// from an interrupted run never lets a stage be skipped.
    pub fn get(&self, stage: &str) -> Option<Stamp> {
        let content = fs::read_to_string(self.path(stage)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn mark(&self, stage: &str) -> Result<(), WorkspaceError> {
        fs::create_dir_all(&self.dir)?;
        let stamp = Stamp {
            stage: stage.to_owned(),
            completed_at: chrono::Utc::now().to_rfc3339(),
        };
        let content = serde_json::to_string_pretty(&stamp)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path(stage))
            .map_err(|e| WorkspaceError::Io(e.error))?;
        crate::fsync_dir(&self.dir)?;
        Ok(())
    }
}
