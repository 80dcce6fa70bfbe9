use crate::exec::{CommandOutput, CommandSpec};
use crate::invoke::{ExitInterpretation, ToolInvoker};
use crate::profile::{EnvironmentProfile, PlatformKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(300);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(900);

/// Privilege level every container invocation of a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Unprivileged,
    Elevated,
}

impl ExecutionMode {
    pub fn is_elevated(self) -> bool {
        self == Self::Elevated
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unprivileged => write!(f, "unprivileged"),
            Self::Elevated => write!(f, "elevated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub binary: String,
    /// Access-control group granting unprivileged use.
    pub group: String,
    pub service: String,
    /// Image run as the no-op verification workload.
    pub probe_image: String,
    pub install_command: Vec<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_owned(),
            group: "docker".to_owned(),
            service: "docker".to_owned(),
            probe_image: "hello-world".to_owned(),
            install_command: ["apt-get", "install", "-y", "docker.io"]
                .map(str::to_owned)
                .to_vec(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("'{binary}' is not available inside this guest; it must be installed on the host")]
    HostSideInstallRequired { binary: String },
    #[error("container runtime installation failed: {0}")]
    InstallFailed(String),
    #[error("container runtime cannot run workloads: {0}")]
    Unusable(String),
}

impl RuntimeError {
    pub fn remediation(&self) -> String {
        match self {
            Self::HostSideInstallRequired { .. } => {
                "install Docker Desktop on the host machine and enable WSL integration for this \
                 distribution (Settings > Resources > WSL integration), then rerun"
                    .to_owned()
            }
            Self::InstallFailed(_) => {
                "install the runtime manually (`sudo apt-get install docker.io`) and rerun"
                    .to_owned()
            }
            Self::Unusable(_) => {
                "start the service (`sudo systemctl start docker`), log out and back in so group \
                 membership applies, then check `docker run --rm hello-world`"
                    .to_owned()
            }
        }
    }
}

/// Brings the container runtime to a verified, usable state and decides the
/// `ExecutionMode` for the rest of the run.
pub struct RuntimeGate<'a> {
    invoker: ToolInvoker<'a>,
    settings: RuntimeSettings,
}

impl<'a> RuntimeGate<'a> {
    pub fn new(invoker: ToolInvoker<'a>, settings: RuntimeSettings) -> Self {
        Self { invoker, settings }
    }

    /// `principal` is the user granted group membership when the
    /// unprivileged probe fails; `None` skips the grant.
    pub fn ensure_runtime_ready(
        &self,
        profile: &EnvironmentProfile,
        principal: Option<&str>,
    ) -> Result<ExecutionMode, RuntimeError> {
        if !profile.has_container_runtime {
            if profile.platform_kind == PlatformKind::VirtualizedLinuxGuest {
                return Err(RuntimeError::HostSideInstallRequired {
                    binary: self.settings.binary.clone(),
                });
            }
            self.install()?;
        }

        let mode = self.verify(principal)?;
        info!("container runtime usable in {mode} mode");
        self.invoker
            .log()
            .record(&format!("mode: {} selected ({mode})", self.settings.binary));
        Ok(mode)
    }

    fn install(&self) -> Result<(), RuntimeError> {
        let Some((program, args)) = self.settings.install_command.split_first() else {
            return Err(RuntimeError::InstallFailed(
                "no install command configured".to_owned(),
            ));
        };
        info!("installing container runtime");
        let out = self
            .invoker
            .invoke(
                &CommandSpec::new(program.as_str())
                    .args(args)
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .elevated(true)
                    .timeout(Some(INSTALL_TIMEOUT)),
            )
            .map_err(|e| RuntimeError::InstallFailed(e.to_string()))?;
        if out.success() {
            Ok(())
        } else {
            Err(RuntimeError::InstallFailed(last_line(&out)))
        }
    }

    fn verify(&self, principal: Option<&str>) -> Result<ExecutionMode, RuntimeError> {
        if self.probe(ExecutionMode::Unprivileged).is_ok() {
            return Ok(ExecutionMode::Unprivileged);
        }

        debug!("unprivileged probe failed; starting service and granting group access");
        if !self.invoker.succeeds(
            &CommandSpec::new("systemctl")
                .args(["start", self.settings.service.as_str()])
                .elevated(true),
        ) {
            warn!("could not start the {} service", self.settings.service);
        }
        if let Some(user) = principal {
            if !self.invoker.succeeds(
                &CommandSpec::new("usermod")
                    .args(["-aG", self.settings.group.as_str(), user])
                    .elevated(true),
            ) {
                warn!("could not add {user} to the {} group", self.settings.group);
            }
        }
        if self.probe(ExecutionMode::Unprivileged).is_ok() {
            return Ok(ExecutionMode::Unprivileged);
        }

        warn!("unprivileged container access still denied; trying elevated");
        self.probe(ExecutionMode::Elevated)
            .map(|()| ExecutionMode::Elevated)
            .map_err(RuntimeError::Unusable)
    }

    fn probe(&self, mode: ExecutionMode) -> Result<(), String> {
        let spec = CommandSpec::new(self.settings.binary.as_str())
            .args(["run", "--rm", self.settings.probe_image.as_str()])
            .elevated(mode.is_elevated())
            .timeout(Some(PROBE_TIMEOUT));
        match self.invoker.invoke(&spec) {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(format!(
                "{mode} probe {}: {}",
                ExitInterpretation::of(&out),
                last_line(&out)
            )),
            Err(e) => Err(format!("{mode} probe: {e}")),
        }
    }
}

fn last_line(out: &CommandOutput) -> String {
    out.combined()
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
        .to_owned()
}

/// One `docker run` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRun {
    /// Host path and container path pairs bind-mounted read-write.
    pub mounts: Vec<(PathBuf, String)>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub command: Vec<String>,
    /// Attach the terminal (`-it`).
    pub interactive: bool,
}

/// Builds every runtime command of a run from the selected `ExecutionMode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInvocation {
    mode: ExecutionMode,
    binary: String,
    image: String,
    user: Option<(u32, u32)>,
}

impl ContainerInvocation {
    pub fn new(mode: ExecutionMode, binary: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            mode,
            binary: binary.into(),
            image: image.into(),
            user: None,
        }
    }

    /// Run containers as the invoking host user so files written to mounts
    /// stay owned by them.
    #[must_use]
    pub fn with_user(mut self, uid: u32, gid: u32) -> Self {
        self.user = Some((uid, gid));
        self
    }

    #[must_use]
    pub fn with_host_user(self) -> Self {
        let (uid, gid) = host_ids();
        self.with_user(uid, gid)
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn base(&self) -> CommandSpec {
        CommandSpec::new(self.binary.as_str()).elevated(self.mode.is_elevated())
    }

    pub fn pull(&self) -> CommandSpec {
        self.base().args(["pull", self.image.as_str()])
    }

    /// Exits 0 when the image is present locally.
    pub fn image_present(&self) -> CommandSpec {
        self.base().args(["image", "inspect", self.image.as_str()])
    }

    pub fn run(&self, request: &ContainerRun) -> CommandSpec {
        let mut spec = self.base().args(["run", "--rm"]);
        if request.interactive {
            spec = spec.arg("-it").interactive(true);
        }
        if let Some((uid, gid)) = self.user {
            spec = spec.args(["--user".to_owned(), format!("{uid}:{gid}")]);
        }
        for (host, target) in &request.mounts {
            spec = spec.args(["-v".to_owned(), format!("{}:{target}", host.display())]);
        }
        for (key, value) in &request.env {
            spec = spec.args(["-e".to_owned(), format!("{key}={value}")]);
        }
        if let Some(dir) = &request.workdir {
            spec = spec.args(["-w", dir.as_str()]);
        }
        spec.arg(self.image.as_str()).args(request.command.iter().cloned())
    }
}

#[allow(unsafe_code)]
fn host_ids() -> (u32, u32) {
    // SAFETY: getuid and getgid have no preconditions and cannot fail.
    unsafe { (libc::getuid(), libc::getgid()) }
}
