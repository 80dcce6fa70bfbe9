use crate::exec::{CommandOutput, CommandSpec, ExecError};
use crate::invoke::ToolInvoker;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const REFRESH_TIMEOUT: Duration = Duration::from_secs(600);
const INDEX_CONF_NAME: &str = "99toolrig-indexes";
const INDEX_CONF: &str = "Acquire::PDiffs \"false\";\nAcquire::Languages \"none\";\n";
const DISABLED_SUFFIX: &str = ".toolrig-disabled";
const REGIONAL_SUFFIX: &str = ".archive.ubuntu.com";

#[derive(Debug, Error)]
pub enum PackageStateError {
    #[error("package index refresh failed{}: {summary}", describe_repairs(.repairs))]
    Unrecoverable {
        repairs: Vec<&'static str>,
        summary: String,
    },
    #[error("package index refresh could not run: {0}")]
    Exec(#[from] ExecError),
    #[error("package configuration I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_repairs(repairs: &[&'static str]) -> String {
    if repairs.is_empty() {
        " and matches no known repair".to_owned()
    } else {
        format!(" again after repairs [{}]", repairs.join(", "))
    }
}

impl PackageStateError {
    pub fn remediation(&self) -> String {
        match self {
            Self::Unrecoverable { .. } => {
                "run `sudo apt-get update` and fix the repository entries it reports under \
                 /etc/apt/sources.list and /etc/apt/sources.list.d/"
                    .to_owned()
            }
            Self::Exec(_) => "make sure apt-get and sudo are installed and usable".to_owned(),
            Self::Io(_) => "check permissions on /etc/apt".to_owned(),
        }
    }
}

/// Locations of the package manager's configuration and cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptPaths {
    pub sources_list: PathBuf,
    pub sources_dir: PathBuf,
    pub conf_dir: PathBuf,
    pub lists_dir: PathBuf,
}

impl AptPaths {
    pub fn system() -> Self {
        Self::under(Path::new("/"))
    }

    /// The standard layout re-rooted at `root`.
    pub fn under(root: &Path) -> Self {
        Self {
            sources_list: root.join("etc/apt/sources.list"),
            sources_dir: root.join("etc/apt/sources.list.d"),
            conf_dir: root.join("etc/apt/apt.conf.d"),
            lists_dir: root.join("var/lib/apt/lists"),
        }
    }

    /// `sources.list` plus every `.list`/`.sources` file, in a stable order.
    fn source_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if self.sources_list.is_file() {
            files.push(self.sources_list.clone());
        }
        if let Ok(entries) = fs::read_dir(&self.sources_dir) {
            let mut extra: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.is_file()
                        && p.extension()
                            .is_some_and(|ext| ext == "list" || ext == "sources")
                })
                .collect();
            extra.sort();
            files.extend(extra);
        }
        files
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerSettings {
    /// Mirror hosts known to be unreliable. Two-letter regional
    /// `xx.archive.ubuntu.com` hosts named in a failure are always included.
    pub bad_mirror_hosts: Vec<String>,
    pub fallback_mirror: String,
    /// Substrings identifying repositories that no longer publish releases.
    pub retired_repos: Vec<String>,
}

impl Default for HealerSettings {
    fn default() -> Self {
        Self {
            bad_mirror_hosts: Vec::new(),
            fallback_mirror: "archive.ubuntu.com".to_owned(),
            retired_repos: Vec::new(),
        }
    }
}

/// A known-bad package manager state paired with the rewrite that fixes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    DisableLocalMedia,
    NormalizeMirrorHosts,
    RemoveRetiredRepos,
    DisableFlakyIndexes,
    ReconcileInterruptedInstall,
    PurgeIndexCache,
}

impl Repair {
    /// Evaluation and application order.
    pub const ORDERED: [Repair; 6] = [
        Self::DisableLocalMedia,
        Self::NormalizeMirrorHosts,
        Self::RemoveRetiredRepos,
        Self::DisableFlakyIndexes,
        Self::ReconcileInterruptedInstall,
        Self::PurgeIndexCache,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::DisableLocalMedia => "disable-local-media",
            Self::NormalizeMirrorHosts => "normalize-mirror-hosts",
            Self::RemoveRetiredRepos => "remove-retired-repos",
            Self::DisableFlakyIndexes => "disable-flaky-indexes",
            Self::ReconcileInterruptedInstall => "reconcile-interrupted-install",
            Self::PurgeIndexCache => "purge-index-cache",
        }
    }

    /// Whether this repair's signature appears in the refresh output.
    pub fn matches(self, output: &str, settings: &HealerSettings) -> bool {
        let failures = failure_lines(output);
        match self {
            Self::DisableLocalMedia => failures.contains("cdrom:"),
            Self::NormalizeMirrorHosts => !mirror_targets(&failures, settings).is_empty(),
            Self::RemoveRetiredRepos => !retired_targets(&failures, settings).is_empty(),
            Self::DisableFlakyIndexes => {
                failures.contains("Hash Sum mismatch") || failures.contains("unexpected size")
            }
            Self::ReconcileInterruptedInstall => failures.contains("dpkg was interrupted"),
            Self::PurgeIndexCache => {
                failures.contains("Hash Sum mismatch")
                    || failures.contains("Clearsigned file isn't valid")
                    || failures.contains("Problem with MergeList")
                    || failures.contains("could not be parsed")
            }
        }
    }
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error and warning lines of apt output; `Hit:`/`Get:` noise is dropped so
/// healthy mirrors listed there never trigger a repair.
fn failure_lines(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|l| {
            l.starts_with("E:") || l.starts_with("W:") || l.starts_with("Err:")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn regional_mirrors(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    for (idx, _) in text.match_indices(REGIONAL_SUFFIX) {
        let label: String = text[..idx]
            .chars()
            .rev()
            .take_while(char::is_ascii_alphanumeric)
            .collect();
        if label.len() == 2 && label.chars().all(|c| c.is_ascii_lowercase()) {
            let host: String = label.chars().rev().collect::<String>() + REGIONAL_SUFFIX;
            if !found.contains(&host) {
                found.push(host);
            }
        }
    }
    found
}

fn mirror_targets(failures: &str, settings: &HealerSettings) -> Vec<String> {
    let mut hosts: Vec<String> = settings
        .bad_mirror_hosts
        .iter()
        .filter(|h| failures.contains(h.as_str()))
        .cloned()
        .collect();
    for host in regional_mirrors(failures) {
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    hosts.retain(|h| *h != settings.fallback_mirror);
    hosts
}

/// Configured retired patterns named in the failure, plus the URL of every
/// non-media repository apt reports as having no Release file.
fn retired_targets(failures: &str, settings: &HealerSettings) -> Vec<String> {
    let mut targets: Vec<String> = settings
        .retired_repos
        .iter()
        .filter(|r| failures.contains(r.as_str()))
        .cloned()
        .collect();
    for line in failures.lines() {
        if !(line.contains("does not have a Release file")
            || line.contains("no longer has a Release file"))
        {
            continue;
        }
        let Some(quoted) = line.split('\'').nth(1) else {
            continue;
        };
        let Some(url) = quoted.split_whitespace().next() else {
            continue;
        };
        if !url.starts_with("cdrom:") && !targets.iter().any(|t| t == url) {
            targets.push(url.to_owned());
        }
    }
    targets
}

fn comment_out(content: &str, pred: impl Fn(&str) -> bool) -> (String, usize) {
    let mut changed = 0;
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('#') && !trimmed.is_empty() && pred(trimmed) {
            out.push_str("# ");
            changed += 1;
        }
        out.push_str(line);
        out.push('\n');
    }
    (out, changed)
}

/// Outcome of a healthy refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealReport {
    /// Repairs applied, in order. Empty when the first refresh succeeded.
    pub repairs: Vec<Repair>,
    pub retried: bool,
}

/// Reactive repair of the apt configuration.
///
/// Refreshes once; only on failure are the repairs whose signature matches
/// the output applied, followed by exactly one more refresh. Every repair is
/// an idempotent rewrite of package manager configuration.
pub struct PackageHealer<'a> {
    invoker: ToolInvoker<'a>,
    paths: AptPaths,
    settings: HealerSettings,
    direct_write: bool,
}

impl<'a> PackageHealer<'a> {
    pub fn new(invoker: ToolInvoker<'a>, paths: AptPaths, settings: HealerSettings) -> Self {
        Self {
            invoker,
            paths,
            settings,
            direct_write: false,
        }
    }

    /// Write configuration files in-process instead of through elevated
    /// `tee`/`mv`. Only valid when this process may write `/etc/apt`.
    #[must_use]
    pub fn direct_write(mut self, direct: bool) -> Self {
        self.direct_write = direct;
        self
    }

    pub fn ensure_package_index_healthy(&self) -> Result<HealReport, PackageStateError> {
        let first = self.refresh()?;
        if first.success() {
            debug!("package index refresh succeeded without repairs");
            return Ok(HealReport::default());
        }

        let output = first.combined();
        warn!("package index refresh failed; matching known repairs");
        let matched: Vec<Repair> = Repair::ORDERED
            .into_iter()
            .filter(|r| r.matches(&output, &self.settings))
            .collect();

        if matched.is_empty() {
            return Err(PackageStateError::Unrecoverable {
                repairs: Vec::new(),
                summary: summarize(&first),
            });
        }

        for repair in &matched {
            let detail = self.apply(*repair, &output)?;
            info!("repair {repair}: {detail}");
            self.invoker
                .log()
                .record(&format!("repair: {repair} ({detail})"));
        }

        let second = self.refresh()?;
        if second.success() {
            Ok(HealReport {
                repairs: matched,
                retried: true,
            })
        } else {
            Err(PackageStateError::Unrecoverable {
                repairs: matched.iter().map(|r| r.name()).collect(),
                summary: summarize(&second),
            })
        }
    }

    fn refresh(&self) -> Result<CommandOutput, PackageStateError> {
        Ok(self.invoker.invoke(
            &CommandSpec::new("apt-get")
                .args(["update"])
                .env("DEBIAN_FRONTEND", "noninteractive")
                .elevated(true)
                .timeout(Some(REFRESH_TIMEOUT)),
        )?)
    }

    fn apply(&self, repair: Repair, output: &str) -> Result<String, PackageStateError> {
        let failures = failure_lines(output);
        match repair {
            Repair::DisableLocalMedia => {
                let n = self.rewrite_sources(|content| {
                    comment_out(content, |l| l.contains("cdrom:"))
                })?;
                Ok(format!("commented {n} local media entr(y/ies)"))
            }
            Repair::NormalizeMirrorHosts => {
                let hosts = mirror_targets(&failures, &self.settings);
                let fallback = &self.settings.fallback_mirror;
                let n = self.rewrite_sources(|content| {
                    let mut out = content.to_owned();
                    let mut count = 0;
                    for host in &hosts {
                        let from = format!("//{host}");
                        count += out.matches(&from).count();
                        out = out.replace(&from, &format!("//{fallback}"));
                    }
                    (out, count)
                })?;
                Ok(format!("{} -> {fallback} in {n} place(s)", hosts.join(", ")))
            }
            Repair::RemoveRetiredRepos => {
                let targets = retired_targets(&failures, &self.settings);
                let mut n = 0;
                for path in self.paths.source_files() {
                    let content = fs::read_to_string(&path)?;
                    let hit = |l: &str| targets.iter().any(|t| l.contains(t.as_str()));
                    if path.extension().is_some_and(|e| e == "sources") {
                        // deb822 stanzas cannot be commented line by line.
                        if content.lines().any(hit) {
                            self.disable_file(&path)?;
                            n += 1;
                        }
                    } else {
                        let (rewritten, changed) = comment_out(&content, hit);
                        if changed > 0 {
                            self.write_config(&path, &rewritten)?;
                            n += changed;
                        }
                    }
                }
                Ok(format!("disabled {n} definition(s) for {}", targets.join(", ")))
            }
            Repair::DisableFlakyIndexes => {
                let path = self.paths.conf_dir.join(INDEX_CONF_NAME);
                if fs::read_to_string(&path).is_ok_and(|c| c == INDEX_CONF) {
                    return Ok(format!("{} already present", path.display()));
                }
                self.write_config(&path, INDEX_CONF)?;
                Ok(format!("wrote {}", path.display()))
            }
            Repair::ReconcileInterruptedInstall => {
                let out = self.invoker.invoke(
                    &CommandSpec::new("dpkg")
                        .args(["--configure", "-a"])
                        .env("DEBIAN_FRONTEND", "noninteractive")
                        .elevated(true),
                )?;
                Ok(format!("dpkg --configure -a ({})", crate::ExitInterpretation::of(&out)))
            }
            Repair::PurgeIndexCache => {
                self.invoker
                    .invoke(&CommandSpec::new("apt-get").arg("clean").elevated(true))?;
                let removed = self.purge_lists()?;
                Ok(format!("cleaned archives, purged {removed} index file(s)"))
            }
        }
    }

    /// Apply `edit` to every sources file, writing back only changed files.
    fn rewrite_sources(
        &self,
        edit: impl Fn(&str) -> (String, usize),
    ) -> Result<usize, PackageStateError> {
        let mut total = 0;
        for path in self.paths.source_files() {
            let content = fs::read_to_string(&path)?;
            let (rewritten, changed) = edit(&content);
            if changed > 0 {
                self.write_config(&path, &rewritten)?;
                total += changed;
            }
        }
        Ok(total)
    }

    fn write_config(&self, path: &Path, content: &str) -> Result<(), PackageStateError> {
        if self.direct_write {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(path).map_err(|e| e.error)?;
            return Ok(());
        }

        let staged = format!("{}.toolrig-new", path.display());
        self.elevated_ok(
            CommandSpec::new("tee")
                .arg(&staged)
                .stdin(content)
                .elevated(true),
        )?;
        self.elevated_ok(
            CommandSpec::new("mv")
                .args([staged, path.display().to_string()])
                .elevated(true),
        )
    }

    fn disable_file(&self, path: &Path) -> Result<(), PackageStateError> {
        let target = format!("{}{DISABLED_SUFFIX}", path.display());
        if self.direct_write {
            fs::rename(path, &target)?;
            return Ok(());
        }
        self.elevated_ok(
            CommandSpec::new("mv")
                .args([path.display().to_string(), target])
                .elevated(true),
        )
    }

    fn purge_lists(&self) -> Result<usize, PackageStateError> {
        let dir = &self.paths.lists_dir;
        let lists = list_files(dir);
        if !self.direct_write {
            self.elevated_ok(
                CommandSpec::new("find")
                    .args([
                        dir.display().to_string(),
                        "-maxdepth".to_owned(),
                        "1".to_owned(),
                        "-type".to_owned(),
                        "f".to_owned(),
                        "!".to_owned(),
                        "-name".to_owned(),
                        "lock".to_owned(),
                        "-delete".to_owned(),
                    ])
                    .elevated(true),
            )?;
            return Ok(lists.len());
        }

        for path in &lists {
            fs::remove_file(path)?;
        }
        Ok(lists.len())
    }

    fn elevated_ok(&self, spec: CommandSpec) -> Result<(), PackageStateError> {
        let out = self.invoker.invoke(&spec)?;
        if out.success() {
            Ok(())
        } else {
            Err(PackageStateError::Io(std::io::Error::other(format!(
                "{} failed: {}",
                spec.command_line(),
                out.stderr.trim()
            ))))
        }
    }

    pub fn paths(&self) -> &AptPaths {
        &self.paths
    }
}

/// Downloaded index files, everything in the lists directory but its lock.
fn list_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name() != "lock")
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect()
}

/// The most telling line of a failed refresh.
fn summarize(output: &CommandOutput) -> String {
    let combined = output.combined();
    combined
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with("E:"))
        .or_else(|| combined.lines().rev().map(str::trim).find(|l| !l.is_empty()))
        .map_or_else(
            || format!("apt-get update ({})", crate::ExitInterpretation::of(output)),
            str::to_owned,
        )
}
