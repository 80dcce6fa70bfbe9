use crate::exec::CommandSpec;
use crate::invoke::{ExitInterpretation, ToolInvoker};
use crate::retry::{retry, Clock, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use toolrig_workspace::{classify_tree, move_aside, TreeState, WorkspaceError, FETCH_MARKER};
use tracing::{debug, info, warn};

/// Attempts made with a full transfer before degrading to shallow.
const FULL_ATTEMPTS: u32 = 2;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch gave up after {attempts} attempt(s): {last}")]
    NetworkExhausted { attempts: u32, last: String },
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("fetch I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("fetch marker serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FetchError {
    pub fn remediation(&self) -> String {
        match self {
            Self::NetworkExhausted { .. } => {
                "check network access to the repository host (proxy, DNS, firewall) and rerun; \
                 completed stages are skipped"
                    .to_owned()
            }
            Self::Workspace(_) | Self::Io(_) | Self::Serialization(_) => {
                "check permissions and free space under the workspace root".to_owned()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub url: String,
    /// Branch, tag or commit to check out; `None` keeps the default branch.
    #[serde(default)]
    pub revision: Option<String>,
}

impl ResourceRef {
    pub fn new(url: impl Into<String>, revision: Option<String>) -> Self {
        Self {
            url: url.into(),
            revision,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    Full,
    /// Latest revision only, no history.
    Shallow,
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Shallow => write!(f, "shallow"),
        }
    }
}

/// Moves a remote resource into a local directory.
///
/// `dest` does not exist when `transfer` is called. A failed transfer may
/// leave partial output behind; the caller removes it.
pub trait Transport {
    fn transfer(
        &self,
        resource: &ResourceRef,
        dest: &Path,
        strategy: FetchStrategy,
        timeout: Option<Duration>,
    ) -> Result<(), String>;
}

pub struct GitTransport<'a> {
    invoker: ToolInvoker<'a>,
}

impl<'a> GitTransport<'a> {
    pub fn new(invoker: ToolInvoker<'a>) -> Self {
        Self { invoker }
    }

    fn git(&self, spec: CommandSpec) -> Result<(), String> {
        match self.invoker.invoke(&spec.env("GIT_TERMINAL_PROMPT", "0")) {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(format!(
                "git {} ({}): {}",
                spec_verb(&out.stderr),
                ExitInterpretation::of(&out),
                out.stderr.lines().last().unwrap_or("").trim()
            )),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn spec_verb(stderr: &str) -> &'static str {
    if stderr.contains("Could not resolve host") || stderr.contains("unable to access") {
        "unreachable"
    } else {
        "failed"
    }
}

impl Transport for GitTransport<'_> {
    fn transfer(
        &self,
        resource: &ResourceRef,
        dest: &Path,
        strategy: FetchStrategy,
        timeout: Option<Duration>,
    ) -> Result<(), String> {
        let mut clone = CommandSpec::new("git").arg("clone").timeout(timeout);
        if strategy == FetchStrategy::Shallow {
            clone = clone.args(["--depth", "1", "--single-branch"]);
            if let Some(rev) = &resource.revision {
                clone = clone.args(["--branch", rev.as_str()]);
            }
        }
        self.git(clone.args([resource.url.clone(), dest.display().to_string()]))?;

        if let (FetchStrategy::Full, Some(rev)) = (strategy, &resource.revision) {
            self.git(
                CommandSpec::new("git")
                    .arg("-C")
                    .arg(dest.display().to_string())
                    .args(["checkout", "--quiet", rev.as_str()]),
            )?;
        }
        Ok(())
    }
}

/// Contents of the fetch marker.
#[derive(Debug, Serialize, Deserialize)]
struct FetchMarker {
    source: String,
    revision: Option<String>,
    strategy: FetchStrategy,
    fetched_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    /// Transfers attempted; zero when skipped.
    pub attempts: u32,
    pub strategy: Option<FetchStrategy>,
    pub skipped: bool,
    /// Where an invalid prior tree was moved.
    pub moved_aside: Option<PathBuf>,
}

/// Bounded-retry fetch into a destination the idempotency check understands.
///
/// A valid destination (fetch marker plus every required path) short-circuits
/// with no transfer. An invalid one is moved aside, never deleted. The marker
/// is written only after a transfer validates, so an interrupted fetch is
/// always classified invalid on the next run.
pub struct Fetcher<'a> {
    transport: &'a dyn Transport,
    clock: &'a dyn Clock,
    required: Vec<String>,
    allow_shallow: bool,
}

impl<'a> Fetcher<'a> {
    pub fn new(transport: &'a dyn Transport, clock: &'a dyn Clock) -> Self {
        Self {
            transport,
            clock,
            required: Vec::new(),
            allow_shallow: false,
        }
    }

    /// Relative paths a completed fetch must contain.
    #[must_use]
    pub fn required(mut self, paths: Vec<String>) -> Self {
        self.required = paths;
        self
    }

    #[must_use]
    pub fn allow_shallow(mut self, allow: bool) -> Self {
        self.allow_shallow = allow;
        self
    }

    fn strategy_for(&self, attempt: u32) -> FetchStrategy {
        if self.allow_shallow && attempt > FULL_ATTEMPTS {
            FetchStrategy::Shallow
        } else {
            FetchStrategy::Full
        }
    }

    pub fn is_satisfied(&self, dest: &Path) -> bool {
        classify_tree(dest, &self.required) == TreeState::Valid
    }

    pub fn fetch(
        &self,
        resource: &ResourceRef,
        dest: &Path,
        policy: &RetryPolicy,
    ) -> Result<FetchReport, FetchError> {
        let moved_aside = match classify_tree(dest, &self.required) {
            TreeState::Valid => {
                debug!("{} already fetched; skipping", dest.display());
                return Ok(FetchReport {
                    attempts: 0,
                    strategy: None,
                    skipped: true,
                    moved_aside: None,
                });
            }
            TreeState::Invalid => Some(move_aside(dest)?),
            TreeState::Missing => None,
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut attempts = 0;
        let result = retry(
            policy,
            self.clock,
            |attempt| {
                attempts = attempt;
                let strategy = self.strategy_for(attempt);
                info!("fetching {} (attempt {attempt}, {strategy})", resource.url);
                self.transport
                    .transfer(resource, dest, strategy, policy.per_attempt_timeout())?;
                self.check_required(dest)?;
                Ok(strategy)
            },
            |attempt, err: &String| {
                warn!("fetch attempt {attempt} failed: {err}");
                discard_partial(dest);
            },
        );

        match result {
            Ok(strategy) => {
                write_marker(dest, resource, strategy)?;
                Ok(FetchReport {
                    attempts,
                    strategy: Some(strategy),
                    skipped: false,
                    moved_aside,
                })
            }
            Err(exhausted) => Err(FetchError::NetworkExhausted {
                attempts: exhausted.attempts,
                last: exhausted.last,
            }),
        }
    }

    fn check_required(&self, dest: &Path) -> Result<(), String> {
        match self.required.iter().find(|rel| !dest.join(rel).exists()) {
            Some(missing) => Err(format!("transfer incomplete: '{missing}' missing")),
            None => Ok(()),
        }
    }
}

fn discard_partial(dest: &Path) {
    if dest.exists() {
        if let Err(e) = fs::remove_dir_all(dest) {
            warn!("cannot remove partial fetch at {}: {e}", dest.display());
        }
    }
}

fn write_marker(
    dest: &Path,
    resource: &ResourceRef,
    strategy: FetchStrategy,
) -> Result<(), FetchError> {
    let marker = FetchMarker {
        source: resource.url.clone(),
        revision: resource.revision.clone(),
        strategy,
        fetched_at: chrono::Utc::now().to_rfc3339(),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dest)?;
    tmp.write_all(&serde_json::to_vec_pretty(&marker)?)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest.join(FETCH_MARKER))
        .map_err(|e| FetchError::Io(e.error))?;
    Ok(())
}
