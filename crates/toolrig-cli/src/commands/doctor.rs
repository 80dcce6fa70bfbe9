use super::{Prepared, Target, EXIT_FAILURE, EXIT_SUCCESS};
use std::path::Path;
use toolrig_core::WorkspaceLock;
use toolrig_host::{check_host_prereqs, format_missing, EnvironmentProfile, PlatformKind, SystemRunner};
use toolrig_workspace::{classify_tree, StageStamps, TreeState};

/// Stamped host stages, in pipeline order.
const STAMPED_STAGES: &[&str] = &["package-index", "host-packages"];

pub fn run(target: &Target, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let runner = SystemRunner::new(false);
    let prepared = match target.prepare() {
        Ok(prepared) => {
            checks.push(Check::pass(
                "config",
                &format!("Configuration valid (image {})", prepared.config.image),
            ));
            Some(prepared)
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("config", &e.to_string()));
            None
        }
    };
    let runtime_binary = prepared
        .as_ref()
        .map_or("docker", |p| p.config.runtime.binary.as_str());

    let profile = toolrig_host::profile::detect(&runner, runtime_binary);
    check_profile(&profile, &mut checks, &mut all_pass);

    let missing = check_host_prereqs(&runner, &profile, runtime_binary);
    if missing.is_empty() {
        checks.push(Check::pass("host_prereqs", "Host prerequisites present"));
    } else {
        checks.push(Check::warn(
            "host_prereqs",
            format_missing(&missing).trim_end(),
        ));
    }

    if let Some(ref prepared) = prepared {
        if prepared.layout.state_dir().exists() {
            check_workspace(prepared, &mut checks, &mut all_pass);
        } else {
            checks.push(Check::info(
                "workspace",
                &format!(
                    "Workspace {} not initialized (created on first run)",
                    prepared.layout.root().display()
                ),
            ));
        }
        check_disk_space(prepared.layout.root(), &mut checks);
    }

    print_results(&checks, all_pass, json_output)
}

fn check_profile(profile: &EnvironmentProfile, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match profile.platform_kind {
        PlatformKind::Unsupported => {
            *all_pass = false;
            checks.push(Check::fail(
                "platform",
                &format!(
                    "Unsupported host: {}",
                    profile.unsupported_reason.as_deref().unwrap_or("unknown reason")
                ),
            ));
        }
        kind => checks.push(Check::pass("platform", &format!("Host platform: {kind}"))),
    }

    if profile.is_elevated {
        checks.push(Check::info("elevation", "Running as root"));
    } else {
        checks.push(Check::info(
            "elevation",
            "Running unprivileged; elevated steps go through sudo",
        ));
    }

    if profile.has_container_runtime {
        checks.push(Check::pass("container_runtime", "Container runtime installed"));
    } else if profile.platform_kind == PlatformKind::VirtualizedLinuxGuest {
        *all_pass = false;
        checks.push(Check::fail(
            "container_runtime",
            "No container runtime; install it on the host and enable WSL integration",
        ));
    } else {
        checks.push(Check::warn(
            "container_runtime",
            "No container runtime (installed on the next run)",
        ));
    }
}

fn check_workspace(prepared: &Prepared, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let layout = &prepared.layout;

    match layout.verify_version() {
        Ok(()) => checks.push(Check::pass("workspace_version", "Workspace format version valid")),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "workspace_version",
                &format!("Workspace version check failed: {e}"),
            ));
        }
    }

    match WorkspaceLock::try_acquire(&layout.lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("workspace_lock", "Workspace lock is free")),
        Ok(None) => checks.push(Check::warn(
            "workspace_lock",
            "Workspace lock is held by a running toolrig",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "workspace_lock",
                &format!("Cannot check workspace lock: {e}"),
            ));
        }
    }

    let repo = layout.runtime_repo();
    match classify_tree(&repo, &prepared.config.repo.required_paths) {
        TreeState::Valid => checks.push(Check::pass(
            "runtime_repo",
            &format!("Runtime repository present at {}", repo.display()),
        )),
        TreeState::Invalid => checks.push(Check::warn(
            "runtime_repo",
            &format!(
                "Runtime repository at {} is incomplete (moved aside on the next run)",
                repo.display()
            ),
        )),
        TreeState::Missing => checks.push(Check::info(
            "runtime_repo",
            "Runtime repository not fetched yet",
        )),
    }

    let pdk = prepared
        .config
        .pdk_root(layout.root())
        .join(&prepared.config.tool.pdk);
    if pdk.is_dir() {
        checks.push(Check::pass("pdk", &format!("PDK installed at {}", pdk.display())));
    } else {
        checks.push(Check::info("pdk", "PDK not installed yet"));
    }

    let stamps = StageStamps::new(layout);
    let done: Vec<String> = STAMPED_STAGES
        .iter()
        .filter_map(|stage| stamps.get(stage))
        .map(|stamp| format!("{} ({})", stamp.stage, stamp.completed_at))
        .collect();
    if done.is_empty() {
        checks.push(Check::info("stamps", "No host stages completed yet"));
    } else {
        checks.push(Check::info(
            "stamps",
            &format!("Completed host stages: {}", done.join(", ")),
        ));
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("toolrig doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

/// Free space on the filesystem holding `root`, or its nearest existing
/// ancestor before the first run.
fn check_disk_space(root: &Path, checks: &mut Vec<Check>) {
    let Some(existing) = root.ancestors().find(|p| p.exists()) else {
        return;
    };
    let Ok(c_path) = std::ffi::CString::new(existing.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: the path is NUL-terminated and the output struct is only read
    // after the call succeeds.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    // Toolchain image plus PDK need several gigabytes.
    let avail_mb = (stat.f_bavail * stat.f_frsize) / (1024 * 1024);
    if avail_mb < 2048 {
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space: {avail_mb} MB available"),
        ));
    } else if avail_mb < 10 * 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Disk space: {avail_mb} MB available (image and PDK need ~10 GB)"),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {} GB available", avail_mb / 1024),
        ));
    }
}
