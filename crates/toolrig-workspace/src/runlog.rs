use crate::WorkspaceError;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Logs larger than this at open time are rotated by filename.
pub const ROTATE_BYTES: u64 = 16 * 1024 * 1024;

/// Append-only run log.
///
/// One timestamped line per stage transition and repair, plus the verbatim
/// output of every external command. The file is never truncated; an
/// oversized log is renamed to `<stem>.<timestamp>.log` and a new one begun.
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self, WorkspaceError> {
        Self::open_with_limit(path, ROTATE_BYTES)
    }

    pub fn open_with_limit(path: &Path, rotate_bytes: u64) -> Result<Self, WorkspaceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Ok(meta) = fs::metadata(path) {
            if meta.len() > rotate_bytes {
                let rotated = rotated_name(path);
                fs::rename(path, &rotated)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a single timestamped line.
    pub fn record(&self, message: &str) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        self.write_raw(&format!("{now} {message}\n"));
    }

    /// Append captured output of an external command verbatim, without
    /// per-line timestamps, so it can be diffed against a manual run.
    pub fn capture(&self, stream: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut block = format!("--- {stream} ---\n{text}");
        if !text.ends_with('\n') {
            block.push('\n');
        }
        self.write_raw(&block);
    }

    fn write_raw(&self, text: &str) {
        let Ok(mut file) = self.file.lock() else {
            warn!("run log mutex poisoned; dropping line");
            return;
        };
        if let Err(e) = file.write_all(text.as_bytes()) {
            warn!("failed to write run log {}: {e}", self.path.display());
        }
    }
}

fn rotated_name(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map_or_else(|| "run".to_owned(), |s| s.to_string_lossy().into_owned());
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let mut candidate = path.with_file_name(format!("{stem}.{stamp}.log"));
    let mut n = 1u32;
    while candidate.exists() {
        candidate = path.with_file_name(format!("{stem}.{stamp}-{n}.log"));
        n += 1;
    }
    candidate
}
