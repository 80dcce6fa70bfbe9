use crate::exec::CommandRunner;
use crate::profile::{EnvironmentProfile, PlatformKind};
use std::fmt;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

/// Check the host tools the pipeline shells out to.
///
/// Missing items are not fatal by themselves: the pipeline installs git and
/// the runtime where it can. This list backs `toolrig doctor`.
pub fn check_host_prereqs(
    runner: &dyn CommandRunner,
    profile: &EnvironmentProfile,
    runtime_binary: &str,
) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !profile.is_elevated && !runner.exists("sudo") {
        missing.push(MissingPrereq {
            name: "sudo",
            purpose: "package installation and elevated container access",
            install_hint: "run as root once: apt-get install sudo",
        });
    }

    if !runner.exists("apt-get") {
        missing.push(MissingPrereq {
            name: "apt-get",
            purpose: "package index refresh and auxiliary installs",
            install_hint: "use a Debian or Ubuntu based distribution",
        });
    }

    if !runner.exists("fuser") {
        missing.push(MissingPrereq {
            name: "fuser",
            purpose: "waiting for package manager locks",
            install_hint: "apt install psmisc",
        });
    }

    if !runner.exists("git") {
        missing.push(MissingPrereq {
            name: "git",
            purpose: "fetching the runtime repository",
            install_hint: "apt install git",
        });
    }

    if !runner.exists(runtime_binary) {
        missing.push(if profile.platform_kind == PlatformKind::VirtualizedLinuxGuest {
            MissingPrereq {
                name: "container runtime",
                purpose: "running the toolchain image",
                install_hint: "install Docker Desktop on the host and enable WSL integration for this distribution",
            }
        } else {
            MissingPrereq {
                name: "container runtime",
                purpose: "running the toolchain image",
                install_hint: "apt install docker.io (toolrig run installs it automatically)",
            }
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg
}
