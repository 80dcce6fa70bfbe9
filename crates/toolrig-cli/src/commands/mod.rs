pub mod completions;
pub mod design;
pub mod doctor;
pub mod progress;
pub mod run;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use progress::Progress;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toolrig_core::{
    check_supported, default_workspace_root, CoreError, Goal, PipelineReport, ProvisionConfig, Provisioner,
    StageError, StageStatus, WorkspaceLock,
};
use toolrig_host::{EnvironmentProfile, SystemClock, SystemRunner, ToolInvoker};
use toolrig_workspace::{RunLog, WorkspaceLayout};
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

/// Workspace and config selection shared by every command.
pub struct Target {
    pub workspace: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

pub struct Prepared {
    pub config: ProvisionConfig,
    pub layout: WorkspaceLayout,
}

impl Target {
    pub fn root(&self) -> Result<PathBuf, CoreError> {
        match &self.workspace {
            Some(path) => Ok(expand_tilde(&path.to_string_lossy())),
            None => Ok(default_workspace_root()?),
        }
    }

    /// Load and validate configuration: flag > environment > file > default.
    pub fn prepare(&self) -> Result<Prepared, CoreError> {
        let root = self.root()?;
        let mut config = ProvisionConfig::load(self.config.as_deref(), &root)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        let layout = WorkspaceLayout::new(root, config.runtime_repo_dir.as_str());
        Ok(Prepared { config, layout })
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    profile: &'a EnvironmentProfile,
    log: &'a Path,
    exit_code: i32,
    #[serde(flatten)]
    report: &'a PipelineReport,
}

/// Provision toward `goal` under the workspace lock and report the outcome.
pub fn execute(target: &Target, goal: &Goal, json_output: bool) -> Result<u8, String> {
    let prepared = target.prepare();
    let runtime_binary = prepared
        .as_ref()
        .map_or("docker", |p| p.config.runtime.binary.as_str());
    let profile = toolrig_host::profile::detect(&SystemRunner::new(false), runtime_binary);
    provision_on(prepared, &profile, goal, json_output)
}

/// An unsupported host is rejected before its configuration is judged or
/// the workspace is touched.
fn provision_on(
    prepared: Result<Prepared, CoreError>,
    profile: &EnvironmentProfile,
    goal: &Goal,
    json_output: bool,
) -> Result<u8, String> {
    if let Err(e) = check_supported(profile) {
        return Ok(report_error(&e));
    }
    let Prepared { config, layout } = match prepared {
        Ok(prepared) => prepared,
        Err(e) => return Ok(report_error(&e.into())),
    };
    let _lock = match WorkspaceLock::acquire_or_busy(&layout.lock_file()) {
        Ok(lock) => lock,
        Err(e) => return Ok(report_error(&e.into())),
    };
    let log = match RunLog::open(&layout.log_path(&goal.run_id())) {
        Ok(log) => log,
        Err(e) => return Ok(report_error(&CoreError::from(e).into())),
    };
    debug!(
        "workspace {} locked; host profile {profile:?}",
        layout.root().display()
    );
    let runner = SystemRunner::new(profile.is_elevated);
    let clock = SystemClock::new();
    let progress = Progress::new(!json_output);

    let report = Provisioner::new(&config, &layout, ToolInvoker::new(&runner, &log), &clock)
        .with_observer(&progress)
        .with_principal(principal())
        .provision(profile, goal);
    progress.finish();

    if json_output {
        let summary = RunSummary {
            profile,
            log: log.path(),
            exit_code: report.exit_code(),
            report: &report,
        };
        println!("{}", json_pretty(&summary)?);
    } else {
        print_summary(&report, log.path());
    }
    if let Some(ref failure) = report.failure {
        print_error(failure);
    }
    Ok(exit_status(report.exit_code()))
}

fn print_summary(report: &PipelineReport, log_path: &Path) {
    for outcome in report.degraded() {
        eprintln!(
            "{} {}: {}",
            Style::new().yellow().apply_to("warning:"),
            outcome.stage,
            outcome.detail
        );
    }
    if report.failure.is_none() {
        println!("provisioning complete");
    }
    println!("log: {}", log_path.display());
}

/// The user to grant container runtime group membership, never root.
fn principal() -> Option<String> {
    std::env::var("SUDO_USER")
        .or_else(|_| std::env::var("USER"))
        .ok()
        .filter(|user| !user.is_empty() && user != "root")
}

pub fn print_error(err: &StageError) {
    eprintln!("error: {err}");
    if let Some(ref hint) = err.remediation {
        eprintln!("hint: {hint}");
    }
}

/// Print a failure that stopped a command before its pipeline started.
pub fn report_error(err: &StageError) -> u8 {
    print_error(err);
    exit_status(err.category.exit_code())
}

pub fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_FAILURE)
}

pub fn json_pretty(value: &impl Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: StageStatus, skipped: bool) -> String {
    match (status, skipped) {
        (StageStatus::Success, true) => Style::new().dim().apply_to("skipped").to_string(),
        (StageStatus::Success, false) => Style::new().green().apply_to("ok").to_string(),
        (StageStatus::Degraded, _) => Style::new().yellow().apply_to("degraded").to_string(),
        (StageStatus::Failed, _) => Style::new().red().bold().apply_to("failed").to_string(),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolrig_core::FailureCategory;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"stage": "pdk"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"stage\""));
        assert!(result.contains("\"pdk\""));
    }

    #[test]
    fn colorize_status_names_each_state() {
        assert!(colorize_status(StageStatus::Success, false).contains("ok"));
        assert!(colorize_status(StageStatus::Success, true).contains("skipped"));
        assert!(colorize_status(StageStatus::Degraded, false).contains("degraded"));
        assert!(colorize_status(StageStatus::Failed, false).contains("failed"));
    }

    #[test]
    fn exit_status_passes_category_codes_through() {
        assert_eq!(exit_status(0), EXIT_SUCCESS);
        assert_eq!(exit_status(FailureCategory::Config.exit_code()), 7);
        assert_eq!(exit_status(FailureCategory::Interrupted.exit_code()), 130);
        assert_eq!(exit_status(-1), EXIT_FAILURE);
    }

    #[test]
    fn report_error_returns_category_code() {
        let err = StageError::new(FailureCategory::LockTimeout, "dpkg lock held");
        assert_eq!(report_error(&err), 5);
    }

    #[test]
    fn prepare_rejects_unpinned_image_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "image = \"efabless/openlane\"\n").unwrap();
        let target = Target {
            workspace: Some(dir.path().to_path_buf()),
            config: Some(file),
        };
        let err = target.prepare().err().unwrap();
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn prepare_uses_workspace_flag_as_root() {
        let dir = tempfile::tempdir().unwrap();
        let target = Target {
            workspace: Some(dir.path().to_path_buf()),
            config: None,
        };
        let prepared = target.prepare().unwrap();
        assert_eq!(prepared.layout.root(), dir.path());
        assert!(prepared.layout.runtime_repo().ends_with("OpenLane"));
    }

    #[test]
    fn unsupported_host_wins_over_bad_config_and_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspace");
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "image = \"efabless/openlane:latest\"\n").unwrap();
        let target = Target {
            workspace: Some(root.clone()),
            config: Some(file),
        };
        let mut profile = EnvironmentProfile::new(
            toolrig_host::PlatformKind::Unsupported,
            false,
            false,
        );
        profile.unsupported_reason = Some("WSL 1 kernel".to_owned());

        let code = provision_on(target.prepare(), &profile, &Goal::SelfTest, true).unwrap();
        assert_eq!(code, 1);
        assert!(!root.exists());
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/srv/toolrig"), PathBuf::from("/srv/toolrig"));
    }

    #[test]
    fn spinner_creates_progress_bar() {
        let pb = spinner("pdk");
        spin_ok(&pb, "pdk ok");
        let pb = spinner("smoke-test");
        spin_fail(&pb, "smoke-test failed");
    }
}
