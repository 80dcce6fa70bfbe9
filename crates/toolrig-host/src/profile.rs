use crate::exec::CommandRunner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    BareLinux,
    VirtualizedLinuxGuest,
    Unsupported,
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BareLinux => write!(f, "bare-linux"),
            Self::VirtualizedLinuxGuest => write!(f, "virtualized-linux-guest"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// Host facts every later stage is conditioned on. Computed once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentProfile {
    pub platform_kind: PlatformKind,
    pub has_container_runtime: bool,
    pub is_elevated: bool,
    /// Why the host is unsupported, with the action that would fix it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsupported_reason: Option<String>,
}

impl EnvironmentProfile {
    pub fn new(platform_kind: PlatformKind, has_container_runtime: bool, is_elevated: bool) -> Self {
        Self {
            platform_kind,
            has_container_runtime,
            is_elevated,
            unsupported_reason: None,
        }
    }
}

/// Raw observations the profiler classifies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSignals {
    pub os: String,
    /// Contents of `/proc/version`.
    pub kernel_version: Option<String>,
    /// `WSL_DISTRO_NAME` or `WSL_INTEROP` is set.
    pub wsl_environment: bool,
    /// A guest display compositor bridge (`/mnt/wslg`) is present.
    pub guest_compositor: bool,
    pub has_package_manager: bool,
    pub has_container_runtime: bool,
    pub effective_uid: u32,
}

impl HostSignals {
    /// Read the signals from the running host. Only reads; never mutates.
    pub fn gather(runner: &dyn CommandRunner, runtime_binary: &str) -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            kernel_version: std::fs::read_to_string("/proc/version").ok(),
            wsl_environment: std::env::var_os("WSL_DISTRO_NAME").is_some()
                || std::env::var_os("WSL_INTEROP").is_some(),
            guest_compositor: Path::new("/mnt/wslg").exists(),
            has_package_manager: runner.exists("apt-get"),
            has_container_runtime: runner.exists(runtime_binary),
            effective_uid: effective_uid(),
        }
    }
}

#[allow(unsafe_code)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid takes no arguments, has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

fn unsupported(signals: &HostSignals, reason: String) -> EnvironmentProfile {
    EnvironmentProfile {
        platform_kind: PlatformKind::Unsupported,
        has_container_runtime: signals.has_container_runtime,
        is_elevated: signals.effective_uid == 0,
        unsupported_reason: Some(reason),
    }
}

/// Classify host signals into exactly one platform kind.
pub fn classify(signals: &HostSignals) -> EnvironmentProfile {
    if signals.os != "linux" {
        return unsupported(
            signals,
            format!(
                "'{}' hosts are not supported; run inside a Linux machine or a WSL 2 distribution",
                signals.os
            ),
        );
    }

    let kernel = signals
        .kernel_version
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let microsoft_kernel = kernel.contains("microsoft");
    let wsl2_kernel = kernel.contains("wsl2") || kernel.contains("microsoft-standard");

    if microsoft_kernel && !wsl2_kernel {
        return unsupported(
            signals,
            "WSL 1 cannot run containers; convert the distribution with `wsl --set-version <distro> 2`"
                .to_owned(),
        );
    }

    if !signals.has_package_manager {
        return unsupported(
            signals,
            "only apt-based distributions (Debian, Ubuntu) are supported".to_owned(),
        );
    }

    let guest = wsl2_kernel
        || signals.wsl_environment
        || (signals.guest_compositor && microsoft_kernel);

    EnvironmentProfile::new(
        if guest {
            PlatformKind::VirtualizedLinuxGuest
        } else {
            PlatformKind::BareLinux
        },
        signals.has_container_runtime,
        signals.effective_uid == 0,
    )
}

/// Gather and classify in one step.
pub fn detect(runner: &dyn CommandRunner, runtime_binary: &str) -> EnvironmentProfile {
    classify(&HostSignals::gather(runner, runtime_binary))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux(kernel: &str) -> HostSignals {
        HostSignals {
            os: "linux".to_owned(),
            kernel_version: Some(kernel.to_owned()),
            has_package_manager: true,
            effective_uid: 1000,
            ..HostSignals::default()
        }
    }

    #[test]
    fn plain_kernel_is_bare_linux() {
        let p = classify(&linux("Linux version 6.8.0-45-generic (buildd@lcy02-amd64-075)"));
        assert_eq!(p.platform_kind, PlatformKind::BareLinux);
        assert!(!p.is_elevated);
        assert!(p.unsupported_reason.is_none());
    }

    #[test]
    fn wsl2_kernel_is_guest() {
        let p = classify(&linux(
            "Linux version 5.15.153.1-microsoft-standard-WSL2 (root@941d701f84f1)",
        ));
        assert_eq!(p.platform_kind, PlatformKind::VirtualizedLinuxGuest);
    }

    #[test]
    fn wsl_environment_variables_mark_guest() {
        let mut s = linux("Linux version 6.6.36.3-custom");
        s.wsl_environment = true;
        assert_eq!(classify(&s).platform_kind, PlatformKind::VirtualizedLinuxGuest);
    }

    #[test]
    fn wsl1_kernel_is_unsupported() {
        let p = classify(&linux("Linux version 4.4.0-19041-Microsoft (Microsoft@Microsoft.com)"));
        assert_eq!(p.platform_kind, PlatformKind::Unsupported);
        assert!(p.unsupported_reason.unwrap().contains("wsl --set-version"));
    }

    #[test]
    fn non_linux_is_unsupported() {
        let s = HostSignals {
            os: "macos".to_owned(),
            has_package_manager: true,
            ..HostSignals::default()
        };
        assert_eq!(classify(&s).platform_kind, PlatformKind::Unsupported);
    }

    #[test]
    fn missing_apt_is_unsupported() {
        let mut s = linux("Linux version 6.8.0");
        s.has_package_manager = false;
        let p = classify(&s);
        assert_eq!(p.platform_kind, PlatformKind::Unsupported);
        assert!(p.unsupported_reason.unwrap().contains("apt"));
    }

    #[test]
    fn root_is_elevated_and_runtime_is_carried() {
        let mut s = linux("Linux version 6.8.0");
        s.effective_uid = 0;
        s.has_container_runtime = true;
        let p = classify(&s);
        assert!(p.is_elevated);
        assert!(p.has_container_runtime);
    }

    #[test]
    fn platform_kind_display() {
        assert_eq!(PlatformKind::VirtualizedLinuxGuest.to_string(), "virtualized-linux-guest");
    }
}
