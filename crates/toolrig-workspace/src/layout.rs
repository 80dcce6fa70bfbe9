use crate::WorkspaceError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

/// Current workspace format version. Incremented on incompatible layout changes.
pub const WORKSPACE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";
const STATE_DIR: &str = ".toolrig";

/// Marker written last into a fetched tree. Its absence means the fetch never
/// completed, whatever else is on disk.
pub const FETCH_MARKER: &str = ".toolrig-fetched";

/// Directory layout of a toolrig workspace.
///
/// ```text
/// <root>/
///   .toolrig/version           format marker
///   .toolrig/stamps/<stage>    host-level stage completion stamps
///   .toolrig/lock              single-process workspace lock
///   <runtime_repo_dir>/        fetched runtime repository
///   <runtime_repo_dir>/designs/<id>/
///   <run-identifier>.log       append-only run logs
/// ```
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
    runtime_repo_dir: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkspaceVersion {
    format_version: u32,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>, runtime_repo_dir: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            runtime_repo_dir: runtime_repo_dir.into(),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn runtime_repo(&self) -> PathBuf {
        self.root.join(&self.runtime_repo_dir)
    }

    #[inline]
    pub fn designs_dir(&self) -> PathBuf {
        self.runtime_repo().join("designs")
    }

    #[inline]
    pub fn design_dir(&self, design_id: &str) -> PathBuf {
        self.designs_dir().join(design_id)
    }

    #[inline]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    #[inline]
    pub fn stamps_dir(&self) -> PathBuf {
        self.state_dir().join("stamps")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join("lock")
    }

    /// Deterministic log path for a run identifier such as `toolrig-run`.
    #[inline]
    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("{run_id}.log"))
    }

    pub fn initialize(&self) -> Result<(), WorkspaceError> {
        fs::create_dir_all(self.stamps_dir())?;

        let state_dir = self.state_dir();
        let version_path = state_dir.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = WorkspaceVersion {
                format_version: WORKSPACE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&state_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| WorkspaceError::Io(e.error))?;
            crate::fsync_dir(&state_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), WorkspaceError> {
        let version_path = self.state_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: WorkspaceVersion = serde_json::from_str(&content)?;

        if ver.format_version != WORKSPACE_FORMAT_VERSION {
            return Err(WorkspaceError::VersionMismatch {
                expected: WORKSPACE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

/// Structural classification of a directory the pipeline owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Missing,
    Valid,
    Invalid,
}

/// A fetched tree is valid only when the fetch marker and every required
/// relative path are present.
pub fn classify_tree(dir: &Path, required: &[String]) -> TreeState {
    if !dir.exists() {
        return TreeState::Missing;
    }
    if !dir.is_dir() || !dir.join(FETCH_MARKER).is_file() {
        return TreeState::Invalid;
    }
    if required.iter().all(|rel| dir.join(rel).exists()) {
        TreeState::Valid
    } else {
        TreeState::Invalid
    }
}

/// A design area is valid when any one of its configuration markers exists.
pub fn classify_design(dir: &Path, markers: &[String]) -> TreeState {
    if !dir.exists() {
        return TreeState::Missing;
    }
    if dir.is_dir() && markers.iter().any(|m| dir.join(m).is_file()) {
        TreeState::Valid
    } else {
        TreeState::Invalid
    }
}

/// Rename `path` to `<path>.stale-<timestamp>` so the evidence of a broken
/// prior run survives. Returns the new location.
pub fn move_aside(path: &Path) -> Result<PathBuf, WorkspaceError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| WorkspaceError::MoveAside {
            path: path.display().to_string(),
            reason: "path has no file name".to_owned(),
        })?
        .to_string_lossy()
        .into_owned();
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");

    for n in 0..100u32 {
        let candidate_name = if n == 0 {
            format!("{file_name}.stale-{stamp}")
        } else {
            format!("{file_name}.stale-{stamp}-{n}")
        };
        let candidate = path.with_file_name(candidate_name);
        if candidate.exists() {
            continue;
        }
        fs::rename(path, &candidate)?;
        warn!(
            "moved invalid {} aside to {}",
            path.display(),
            candidate.display()
        );
        return Ok(candidate);
    }

    Err(WorkspaceError::MoveAside {
        path: path.display().to_string(),
        reason: "no free stale-* name".to_owned(),
    })
}

pub fn validate_design_id(id: &str) -> Result<(), WorkspaceError> {
    if id.is_empty() || id.len() > 64 {
        return Err(WorkspaceError::InvalidDesignId(
            "design identifier must be 1-64 characters".to_owned(),
        ));
    }
    if id.starts_with('-')
        || !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(WorkspaceError::InvalidDesignId(format!(
            "'{id}' must match [a-zA-Z0-9_-] and not start with '-'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Vec<String> {
        vec!["flow.tcl".to_owned(), "designs".to_owned()]
    }

    #[test]
    fn layout_paths_are_correct() {
        let layout = WorkspaceLayout::new("/tmp/toolrig-test", "toolchain");
        assert_eq!(
            layout.runtime_repo(),
            PathBuf::from("/tmp/toolrig-test/toolchain")
        );
        assert_eq!(
            layout.design_dir("spm"),
            PathBuf::from("/tmp/toolrig-test/toolchain/designs/spm")
        );
        assert_eq!(
            layout.stamps_dir(),
            PathBuf::from("/tmp/toolrig-test/.toolrig/stamps")
        );
        assert_eq!(
            layout.log_path("toolrig-run"),
            PathBuf::from("/tmp/toolrig-test/toolrig-run.log")
        );
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path(), "toolchain");
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
        assert!(layout.stamps_dir().is_dir());
    }

    #[test]
    fn initialize_rejects_future_version() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path(), "toolchain");
        fs::create_dir_all(layout.state_dir()).unwrap();
        fs::write(
            layout.state_dir().join(VERSION_FILE),
            r#"{"format_version": 99}"#,
        )
        .unwrap();
        assert!(matches!(
            layout.initialize(),
            Err(WorkspaceError::VersionMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn classify_missing_tree() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            classify_tree(&dir.path().join("absent"), &required()),
            TreeState::Missing
        );
    }

    #[test]
    fn tree_without_marker_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(repo.join("designs")).unwrap();
        fs::write(repo.join("flow.tcl"), "").unwrap();
        assert_eq!(classify_tree(&repo, &required()), TreeState::Invalid);
    }

    #[test]
    fn tree_with_marker_but_missing_path_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        fs::write(repo.join(FETCH_MARKER), "{}").unwrap();
        fs::write(repo.join("flow.tcl"), "").unwrap();
        assert_eq!(classify_tree(&repo, &required()), TreeState::Invalid);
    }

    #[test]
    fn complete_tree_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(repo.join("designs")).unwrap();
        fs::write(repo.join("flow.tcl"), "").unwrap();
        fs::write(repo.join(FETCH_MARKER), "{}").unwrap();
        assert_eq!(classify_tree(&repo, &required()), TreeState::Valid);
    }

    #[test]
    fn design_needs_any_marker() {
        let dir = tempfile::tempdir().unwrap();
        let design = dir.path().join("spm");
        let markers = vec!["config.json".to_owned(), "config.tcl".to_owned()];
        fs::create_dir_all(design.join("src")).unwrap();
        assert_eq!(classify_design(&design, &markers), TreeState::Invalid);
        fs::write(design.join("config.tcl"), "").unwrap();
        assert_eq!(classify_design(&design, &markers), TreeState::Valid);
    }

    #[test]
    fn move_aside_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("toolchain");
        fs::create_dir_all(&repo).unwrap();
        fs::write(repo.join("leftover"), "evidence").unwrap();

        let moved = move_aside(&repo).unwrap();
        assert!(!repo.exists());
        assert!(moved
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("toolchain.stale-"));
        assert_eq!(
            fs::read_to_string(moved.join("leftover")).unwrap(),
            "evidence"
        );
    }

    #[test]
    fn move_aside_twice_picks_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("toolchain");
        fs::create_dir_all(&repo).unwrap();
        let first = move_aside(&repo).unwrap();
        fs::create_dir_all(&repo).unwrap();
        let second = move_aside(&repo).unwrap();
        assert_ne!(first, second);
        assert!(first.exists());
        assert!(second.exists());
    }

    #[test]
    fn design_id_validation() {
        assert!(validate_design_id("spm").is_ok());
        assert!(validate_design_id("my_design-2").is_ok());
        assert!(validate_design_id("").is_err());
        assert!(validate_design_id("../etc").is_err());
        assert!(validate_design_id("-flag").is_err());
        assert!(validate_design_id(&"x".repeat(65)).is_err());
    }
}
