//! The standard provisioning pipelines.
//!
//! Stages run in dependency order: package locks, package index healing,
//! auxiliary packages, container runtime gate, runtime repository fetch,
//! image pull, PDK install, then the downstream tool and result inspection.
//! Host-level stages with nothing to show in the workspace are recorded in
//! `StageStamps`; everything else is checked structurally on disk.

use crate::config::{ImageRef, ProvisionConfig};
use crate::failure::{FailureCategory, StageError};
use crate::pipeline::{
    ActionStatus, FailurePolicy, NoopObserver, Orchestrator, PipelineReport, StageDescriptor,
    StageObserver,
};
use crate::{shutdown_requested, CoreError};
use std::fs;
use std::path::PathBuf;
use toolrig_host::{
    retry, wait_for_lock, AptPaths, Clock, CommandSpec, ContainerInvocation, ContainerRun,
    EnvironmentProfile, ExecutionMode, ExitInterpretation, FetchStrategy, Fetcher, FuserProbe,
    GitTransport, PackageHealer, PlatformKind, RuntimeGate, ToolInvoker,
};
use toolrig_workspace::{
    classify_design, classify_tree, move_aside, validate_design_id, StageStamps, TreeState,
    WorkspaceLayout,
};
use tracing::{info, warn};

const PACKAGE_LOCK: &str = "package-lock";
const PACKAGE_INDEX: &str = "package-index";
const HOST_PACKAGES: &str = "host-packages";
const CONTAINER_RUNTIME: &str = "container-runtime";
const RUNTIME_REPO: &str = "runtime-repo";
const CONTAINER_IMAGE: &str = "container-image";
const PDK: &str = "pdk";
const SMOKE_TEST: &str = "smoke-test";
const RESULT_INSPECTION: &str = "result-inspection";
const DESIGN_AREA: &str = "design-area";
const DESIGN_FLOW: &str = "design-flow";
const INTERACTIVE_SESSION: &str = "interactive-session";

/// How the design command drives the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesignMode {
    /// `1`: full non-interactive flow.
    Batch,
    /// `2`: interactive step shell.
    Interactive,
}

impl DesignMode {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        match input.trim() {
            "1" => Ok(Self::Batch),
            "2" => Ok(Self::Interactive),
            other => Err(CoreError::InvalidMode(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Goal {
    /// Provision and verify with the configured smoke-test design.
    SelfTest,
    Design { id: String, mode: DesignMode },
}

impl Goal {
    pub fn design(id: &str, mode: DesignMode) -> Result<Self, CoreError> {
        validate_design_id(id)?;
        Ok(Self::Design {
            id: id.to_owned(),
            mode,
        })
    }

    /// Names the run log: `<workspace_root>/<run_id>.log`.
    pub fn run_id(&self) -> String {
        match self {
            Self::SelfTest => "toolrig-run".to_owned(),
            Self::Design { id, .. } => format!("toolrig-design-{id}"),
        }
    }
}

/// State threaded through the stages of one run.
pub struct ProvisionContext<'a> {
    pub config: &'a ProvisionConfig,
    pub image: ImageRef,
    pub layout: &'a WorkspaceLayout,
    pub profile: &'a EnvironmentProfile,
    pub invoker: ToolInvoker<'a>,
    pub clock: &'a dyn Clock,
    pub stamps: StageStamps,
    pub apt_paths: AptPaths,
    pub principal: Option<String>,
    /// Design the tool stages act on.
    pub design: String,
    /// Set by the container-runtime stage; every later container command
    /// is built from it.
    pub mode: Option<ExecutionMode>,
}

impl ProvisionContext<'_> {
    fn execution_mode(&self) -> Result<ExecutionMode, StageError> {
        self.mode.ok_or_else(|| {
            StageError::new(
                FailureCategory::Runtime,
                "no execution mode selected before a container stage",
            )
        })
    }

    fn containers(&self) -> Result<ContainerInvocation, StageError> {
        Ok(ContainerInvocation::new(
            self.execution_mode()?,
            self.config.runtime.binary.as_str(),
            self.image.to_string(),
        )
        .with_host_user())
    }

    fn pdk_root(&self) -> PathBuf {
        self.config.pdk_root(self.layout.root())
    }

    fn artifact_path(&self) -> PathBuf {
        let rel = self
            .config
            .tool
            .expand_one(&self.config.tool.result_artifact, &self.design, &self.pdk_root());
        self.layout.runtime_repo().join(rel)
    }

    fn expand(&self, template: &[String]) -> Vec<String> {
        self.config
            .tool
            .expand(template, &self.design, &self.pdk_root())
    }

    /// A tool container with the runtime repository and PDK root mounted.
    fn tool_run(&self, command: Vec<String>, interactive: bool) -> ContainerRun {
        let pdk_root = self.pdk_root();
        let pdk_root_str = pdk_root.display().to_string();
        ContainerRun {
            mounts: vec![
                (
                    self.layout.runtime_repo(),
                    self.config.tool.mount_point.clone(),
                ),
                (pdk_root, pdk_root_str.clone()),
            ],
            env: vec![
                ("PDK_ROOT".to_owned(), pdk_root_str),
                ("PDK".to_owned(), self.config.tool.pdk.clone()),
            ],
            workdir: Some(self.config.tool.mount_point.clone()),
            command,
            interactive,
        }
    }
}

fn never_satisfied(_: &ProvisionContext<'_>) -> bool {
    false
}

fn apt_stages_stamped(ctx: &ProvisionContext<'_>) -> bool {
    ctx.stamps.has(PACKAGE_INDEX) && ctx.stamps.has(HOST_PACKAGES)
}

fn wait_package_locks(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let probe = FuserProbe::new(ctx.invoker, true);
    for lock in &ctx.config.packages.lock_paths {
        let waited = wait_for_lock(lock, &ctx.config.retry.lock, &probe, ctx.clock)?;
        if !waited.is_zero() {
            ctx.invoker
                .log()
                .record(&format!("lock: {lock} free after {}s", waited.as_secs()));
        }
    }
    Ok(ActionStatus::Done)
}

fn package_index_stamped(ctx: &ProvisionContext<'_>) -> bool {
    ctx.stamps.has(PACKAGE_INDEX)
}

fn heal_package_index(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let report = PackageHealer::new(
        ctx.invoker,
        ctx.apt_paths.clone(),
        ctx.config.packages.healer_settings(),
    )
    .direct_write(ctx.profile.is_elevated)
    .ensure_package_index_healthy()?;
    ctx.stamps.mark(PACKAGE_INDEX)?;
    if report.repairs.is_empty() {
        Ok(ActionStatus::Done)
    } else {
        let names: Vec<&str> = report.repairs.iter().map(|r| r.name()).collect();
        Ok(ActionStatus::Summary(format!("healed: {}", names.join(", "))))
    }
}

fn host_packages_stamped(ctx: &ProvisionContext<'_>) -> bool {
    ctx.stamps.has(HOST_PACKAGES)
}

fn install_host_packages(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let packages = &ctx.config.packages.auxiliary;
    if !packages.is_empty() {
        let out = ctx.invoker.invoke(
            &CommandSpec::new("apt-get")
                .args(["install", "-y", "--no-install-recommends"])
                .args(packages)
                .env("DEBIAN_FRONTEND", "noninteractive")
                .elevated(true),
        )?;
        if !out.success() {
            return Err(StageError::new(
                FailureCategory::PackageState,
                format!(
                    "apt-get install {} ({})",
                    packages.join(" "),
                    ExitInterpretation::of(&out)
                ),
            ));
        }
    }
    ctx.stamps.mark(HOST_PACKAGES)?;
    Ok(ActionStatus::Done)
}

fn select_execution_mode(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let mode = RuntimeGate::new(ctx.invoker, ctx.config.runtime.clone())
        .ensure_runtime_ready(ctx.profile, ctx.principal.as_deref())?;
    ctx.mode = Some(mode);
    Ok(ActionStatus::Summary(format!("{mode} mode")))
}

fn runtime_repo_valid(ctx: &ProvisionContext<'_>) -> bool {
    classify_tree(&ctx.layout.runtime_repo(), &ctx.config.repo.required_paths) == TreeState::Valid
}

fn fetch_runtime_repo(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let transport = GitTransport::new(ctx.invoker);
    let report = Fetcher::new(&transport, ctx.clock)
        .required(ctx.config.repo.required_paths.clone())
        .allow_shallow(ctx.config.repo.allow_shallow)
        .fetch(
            &ctx.config.repo.resource(),
            &ctx.layout.runtime_repo(),
            &ctx.config.retry.fetch,
        )?;
    if let Some(stale) = &report.moved_aside {
        ctx.invoker
            .log()
            .record(&format!("workspace: moved invalid tree to {}", stale.display()));
    }
    if report.strategy == Some(FetchStrategy::Shallow) {
        return Ok(ActionStatus::Degraded(format!(
            "shallow clone after {} attempt(s); history unavailable",
            report.attempts
        )));
    }
    Ok(ActionStatus::Done)
}

fn image_present(ctx: &ProvisionContext<'_>) -> bool {
    ctx.containers()
        .is_ok_and(|containers| ctx.invoker.succeeds(&containers.image_present()))
}

fn pull_image(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let containers = ctx.containers()?;
    let pull = containers.pull();
    retry(
        &ctx.config.retry.image,
        ctx.clock,
        |_| match ctx.invoker.invoke(&pull) {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(format!(
                "{} ({})",
                out.stderr.lines().last().unwrap_or("").trim(),
                ExitInterpretation::of(&out)
            )),
            Err(e) => Err(e.to_string()),
        },
        |attempt, e| warn!("pull attempt {attempt} of {} failed: {e}", ctx.image),
    )
    .map_err(|exhausted| {
        StageError::new(
            FailureCategory::Network,
            format!(
                "pull of {} failed after {} attempt(s): {}",
                ctx.image, exhausted.attempts, exhausted.last
            ),
        )
        .with_remediation("check access to the image registry, or pull the image manually")
    })?;
    Ok(ActionStatus::Done)
}

fn pdk_installed(ctx: &ProvisionContext<'_>) -> bool {
    ctx.pdk_root().join(&ctx.config.tool.pdk).is_dir()
}

fn install_pdk(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let mode = ctx.execution_mode()?;
    let pdk_root = ctx.pdk_root();
    fs::create_dir_all(&pdk_root)?;

    let command = ctx.expand(&ctx.config.tool.pdk_install_command);
    let Some((program, args)) = command.split_first() else {
        return Err(StageError::new(
            FailureCategory::Config,
            "tool.pdk_install_command is empty",
        ));
    };
    // The install drives the container runtime itself.
    let out = ctx.invoker.invoke(
        &CommandSpec::new(program.as_str())
            .args(args)
            .cwd(ctx.layout.runtime_repo())
            .env("PDK_ROOT", pdk_root.display().to_string())
            .env("PDK", ctx.config.tool.pdk.as_str())
            .elevated(mode.is_elevated()),
    )?;
    if !out.success() {
        return Err(StageError::tool(format!(
            "{} ({})",
            command.join(" "),
            ExitInterpretation::of(&out)
        )));
    }
    if !pdk_installed(ctx) {
        return Err(StageError::tool(format!(
            "{} finished but {} is missing",
            command.join(" "),
            pdk_root.join(&ctx.config.tool.pdk).display()
        )));
    }
    Ok(ActionStatus::Done)
}

fn result_artifact_present(ctx: &ProvisionContext<'_>) -> bool {
    ctx.artifact_path().is_file()
}

/// Non-zero exit with the artifact present degrades; no artifact fails.
fn run_flow(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let containers = ctx.containers()?;
    let command = ctx.expand(&ctx.config.tool.flow_command);
    let out = ctx
        .invoker
        .invoke(&containers.run(&ctx.tool_run(command, false)))?;
    let artifact = ctx.artifact_path();
    let verdict = ExitInterpretation::of(&out);

    match (out.success(), artifact.is_file()) {
        (true, true) => Ok(ActionStatus::Done),
        (false, true) => Ok(ActionStatus::Degraded(format!(
            "flow for {} ended with {verdict}; result at {}",
            ctx.design,
            artifact.display()
        ))),
        (_, false) => Err(StageError::tool(format!(
            "flow for {} ({verdict}) produced no result at {}",
            ctx.design,
            artifact.display()
        ))
        .with_remediation(format!(
            "see the tool output in {}",
            ctx.invoker.log().path().display()
        ))),
    }
}

fn inspect_result(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let artifact = ctx.artifact_path();
    let content = fs::read_to_string(&artifact).map_err(|e| {
        StageError::tool(format!("cannot read result {}: {e}", artifact.display()))
    })?;
    let summary = summarize_metrics(&ctx.design, &content);
    info!("{summary}");
    ctx.invoker.log().record(&format!("result: {summary}"));
    Ok(ActionStatus::Summary(summary))
}

/// One-line digest of a `header\nvalues` metrics CSV.
fn summarize_metrics(design: &str, csv: &str) -> String {
    let mut lines = csv.lines().filter(|l| !l.trim().is_empty());
    let (Some(header), Some(values)) = (lines.next(), lines.next()) else {
        return format!("{design}: result present, no metrics rows");
    };
    let header: Vec<&str> = header.split(',').map(str::trim).collect();
    let values: Vec<&str> = values.split(',').map(str::trim).collect();
    let status = header
        .iter()
        .position(|h| *h == "flow_status")
        .and_then(|i| values.get(i));
    match status {
        Some(s) => format!("{design}: {} metrics, flow_status={s}", header.len()),
        None => format!("{design}: {} metrics", header.len()),
    }
}

fn design_area_valid(ctx: &ProvisionContext<'_>) -> bool {
    classify_design(
        &ctx.layout.design_dir(&ctx.design),
        &ctx.config.tool.design_markers,
    ) == TreeState::Valid
}

fn prepare_design_area(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let dir = ctx.layout.design_dir(&ctx.design);
    if classify_design(&dir, &ctx.config.tool.design_markers) == TreeState::Invalid {
        let stale = move_aside(&dir)?;
        ctx.invoker
            .log()
            .record(&format!("workspace: moved invalid design area to {}", stale.display()));
    }

    let containers = ctx.containers()?;
    let command = ctx.expand(&ctx.config.tool.init_command);
    let out = ctx
        .invoker
        .invoke(&containers.run(&ctx.tool_run(command, false)))?;
    if design_area_valid(ctx) {
        Ok(ActionStatus::Done)
    } else {
        Err(StageError::tool(format!(
            "design init for '{}' ({}) left no {} in {}",
            ctx.design,
            ExitInterpretation::of(&out),
            ctx.config.tool.design_markers.join(" or "),
            dir.display()
        )))
    }
}

fn interactive_session(ctx: &mut ProvisionContext<'_>) -> Result<ActionStatus, StageError> {
    let containers = ctx.containers()?;
    let command = ctx.expand(&ctx.config.tool.interactive_command);
    let out = ctx
        .invoker
        .invoke(&containers.run(&ctx.tool_run(command, true)))?;
    if out.success() {
        Ok(ActionStatus::Done)
    } else {
        Err(StageError::tool(format!(
            "interactive session ended with {}",
            ExitInterpretation::of(&out)
        )))
    }
}

type Stage<'a> = StageDescriptor<ProvisionContext<'a>>;

fn host_stages<'a>() -> Vec<Stage<'a>> {
    vec![
        StageDescriptor::new(
            PACKAGE_LOCK,
            apt_stages_stamped,
            wait_package_locks,
            FailurePolicy::RetryThenFatal,
        ),
        StageDescriptor::new(
            PACKAGE_INDEX,
            package_index_stamped,
            heal_package_index,
            FailurePolicy::Fatal,
        ),
        StageDescriptor::new(
            HOST_PACKAGES,
            host_packages_stamped,
            install_host_packages,
            FailurePolicy::DegradeAndContinue,
        ),
        StageDescriptor::new(
            CONTAINER_RUNTIME,
            never_satisfied,
            select_execution_mode,
            FailurePolicy::Fatal,
        ),
        StageDescriptor::new(
            RUNTIME_REPO,
            runtime_repo_valid,
            fetch_runtime_repo,
            FailurePolicy::Fatal,
        ),
        StageDescriptor::new(
            CONTAINER_IMAGE,
            image_present,
            pull_image,
            FailurePolicy::RetryThenFatal,
        ),
        StageDescriptor::new(PDK, pdk_installed, install_pdk, FailurePolicy::Fatal),
    ]
}

/// `toolrig run`: provision, then verify with the smoke-test design.
pub fn self_test_pipeline<'a>() -> Vec<Stage<'a>> {
    let mut stages = host_stages();
    stages.push(StageDescriptor::new(
        SMOKE_TEST,
        result_artifact_present,
        run_flow,
        FailurePolicy::Fatal,
    ));
    stages.push(StageDescriptor::new(
        RESULT_INSPECTION,
        never_satisfied,
        inspect_result,
        FailurePolicy::DegradeAndContinue,
    ));
    stages
}

/// `toolrig design <id>`.
pub fn design_pipeline<'a>(mode: DesignMode) -> Vec<Stage<'a>> {
    let mut stages = host_stages();
    stages.push(StageDescriptor::new(
        DESIGN_AREA,
        design_area_valid,
        prepare_design_area,
        FailurePolicy::Fatal,
    ));
    match mode {
        DesignMode::Batch => {
            stages.push(StageDescriptor::new(
                DESIGN_FLOW,
                result_artifact_present,
                run_flow,
                FailurePolicy::Fatal,
            ));
            stages.push(StageDescriptor::new(
                RESULT_INSPECTION,
                never_satisfied,
                inspect_result,
                FailurePolicy::DegradeAndContinue,
            ));
        }
        DesignMode::Interactive => stages.push(StageDescriptor::new(
            INTERACTIVE_SESSION,
            never_satisfied,
            interactive_session,
            FailurePolicy::DegradeAndContinue,
        )),
    }
    stages
}

/// Reject a host no stage can run on, before anything touches it.
pub fn check_supported(profile: &EnvironmentProfile) -> Result<(), StageError> {
    if profile.platform_kind != PlatformKind::Unsupported {
        return Ok(());
    }
    let reason = profile
        .unsupported_reason
        .clone()
        .unwrap_or_else(|| "this host cannot run the pipeline".to_owned());
    Err(StageError::new(FailureCategory::UnsupportedEnvironment, reason)
        .with_remediation("run toolrig on an apt-based Linux host or a WSL 2 distribution"))
}

/// Entry point for one provisioning run.
pub struct Provisioner<'a> {
    config: &'a ProvisionConfig,
    layout: &'a WorkspaceLayout,
    invoker: ToolInvoker<'a>,
    clock: &'a dyn Clock,
    observer: &'a dyn StageObserver,
    apt_paths: AptPaths,
    principal: Option<String>,
    interrupted: fn() -> bool,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        config: &'a ProvisionConfig,
        layout: &'a WorkspaceLayout,
        invoker: ToolInvoker<'a>,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            config,
            layout,
            invoker,
            clock,
            observer: &NoopObserver,
            apt_paths: AptPaths::system(),
            principal: None,
            interrupted: shutdown_requested,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: &'a dyn StageObserver) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_apt_paths(mut self, paths: AptPaths) -> Self {
        self.apt_paths = paths;
        self
    }

    /// User granted container runtime group membership if needed.
    #[must_use]
    pub fn with_principal(mut self, principal: Option<String>) -> Self {
        self.principal = principal;
        self
    }

    #[must_use]
    pub fn with_interrupt_check(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }

    pub fn provision(&self, profile: &EnvironmentProfile, goal: &Goal) -> PipelineReport {
        let log = self.invoker.log();
        log.record(&format!(
            "profile: {} runtime={} elevated={}",
            profile.platform_kind, profile.has_container_runtime, profile.is_elevated
        ));

        if let Err(e) = check_supported(profile) {
            log.record(&format!("pipeline: aborted ({})", e.message));
            return PipelineReport::aborted(e);
        }

        let image = match self.config.validate() {
            Ok(image) => image,
            Err(e) => return PipelineReport::aborted(e.into()),
        };
        if let Err(e) = self.layout.initialize() {
            return PipelineReport::aborted(e.into());
        }

        let (design, pipeline) = match goal {
            Goal::SelfTest => (
                self.config.tool.smoke_test_design.clone(),
                self_test_pipeline(),
            ),
            Goal::Design { id, mode } => (id.clone(), design_pipeline(*mode)),
        };

        let mut ctx = ProvisionContext {
            config: self.config,
            image,
            layout: self.layout,
            profile,
            invoker: self.invoker,
            clock: self.clock,
            stamps: StageStamps::new(self.layout),
            apt_paths: self.apt_paths.clone(),
            principal: self.principal.clone(),
            design,
            mode: None,
        };

        let report = Orchestrator::new(log, self.clock)
            .with_observer(self.observer)
            .with_interrupt_check(self.interrupted)
            .run(&pipeline, &mut ctx);
        log.record(&format!(
            "pipeline: {} (exit {})",
            match report.failure {
                None => "success".to_owned(),
                Some(ref e) => format!("failed: {e}"),
            },
            report.exit_code()
        ));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!(DesignMode::parse("1\n").unwrap(), DesignMode::Batch);
        assert_eq!(DesignMode::parse(" 2").unwrap(), DesignMode::Interactive);
        assert!(matches!(DesignMode::parse("3"), Err(CoreError::InvalidMode(_))));
    }

    #[test]
    fn goal_run_ids() {
        assert_eq!(Goal::SelfTest.run_id(), "toolrig-run");
        let goal = Goal::design("picorv32a", DesignMode::Batch).unwrap();
        assert_eq!(goal.run_id(), "toolrig-design-picorv32a");
        assert!(Goal::design("../etc", DesignMode::Batch).is_err());
    }

    #[test]
    fn pipelines_keep_declared_order() {
        let names: Vec<&str> = self_test_pipeline().iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "package-lock",
                "package-index",
                "host-packages",
                "container-runtime",
                "runtime-repo",
                "container-image",
                "pdk",
                "smoke-test",
                "result-inspection",
            ]
        );
        let interactive: Vec<&str> = design_pipeline(DesignMode::Interactive)
            .iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(interactive[7..], ["design-area", "interactive-session"]);
    }

    #[test]
    fn metrics_summary() {
        let csv = "design,flow_status,DIEAREA_mm^2\nspm,flow completed,0.0123\n";
        assert_eq!(summarize_metrics("spm", csv), "spm: 3 metrics, flow_status=flow completed");
        assert_eq!(summarize_metrics("spm", "a,b\n1,2"), "spm: 2 metrics");
        assert!(summarize_metrics("spm", "").contains("no metrics rows"));
    }
}
