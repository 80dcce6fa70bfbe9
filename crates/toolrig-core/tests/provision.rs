//! End-to-end provisioning runs against a scripted host.

use std::fs;
use std::path::{Path, PathBuf};
use toolrig_core::{
    DesignMode, FailureCategory, Goal, PipelineReport, PipelineStatus, ProvisionConfig,
    Provisioner, StageStatus,
};
use toolrig_host::mock::{Reply, ScriptedRunner};
use toolrig_host::{AptPaths, CommandSpec, EnvironmentProfile, ManualClock, PlatformKind, ToolInvoker};
use toolrig_workspace::{RunLog, WorkspaceLayout};

const METRICS: &str = "design,flow_status,DIEAREA_mm^2\nspm,flow completed,0.0123\n";

struct Host {
    _dir: tempfile::TempDir,
    root: PathBuf,
    apt_root: PathBuf,
    config: ProvisionConfig,
    layout: WorkspaceLayout,
    runner: ScriptedRunner,
    clock: ManualClock,
}

fn never_interrupted() -> bool {
    false
}

fn env_value<'a>(spec: &'a CommandSpec, key: &str) -> Option<&'a str> {
    spec.env
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn touch(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn host(sources: &str) -> Host {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("toolrig");
    let apt_root = dir.path().join("host");
    let paths = AptPaths::under(&apt_root);
    fs::create_dir_all(&paths.sources_dir).unwrap();
    fs::create_dir_all(&paths.conf_dir).unwrap();
    fs::create_dir_all(&paths.lists_dir).unwrap();
    fs::write(&paths.sources_list, sources).unwrap();

    let config = ProvisionConfig::default();
    let layout = WorkspaceLayout::new(&root, config.runtime_repo_dir.as_str());
    let runner = ScriptedRunner::new();

    // Nobody holds the package locks.
    runner.on("fuser", [Reply::fail(1, "")]);
    runner.on(
        "git clone",
        [Reply::ok("").with_effect(|spec| {
            let dest = PathBuf::from(spec.args.last().unwrap());
            touch(&dest.join("Makefile"), "all:\n");
            touch(&dest.join("flow.tcl"), "#!/usr/bin/env tclsh\n");
        })],
    );
    runner.on(
        "make pdk",
        [Reply::ok("").with_effect(|spec| {
            let pdk_root = PathBuf::from(env_value(spec, "PDK_ROOT").unwrap());
            fs::create_dir_all(pdk_root.join(env_value(spec, "PDK").unwrap())).unwrap();
        })],
    );
    runner.on(
        "docker image inspect",
        [Reply::fail(1, "Error: No such image"), Reply::ok("[]")],
    );

    Host {
        _dir: dir,
        root,
        apt_root,
        config,
        layout,
        runner,
        clock: ManualClock::new(),
    }
}

/// Tool containers create what the real flow would: the design area on
/// init, the metrics report on a flow run.
fn tool_runs_produce_results(h: &Host, flow_reply: Reply) {
    let repo = h.layout.runtime_repo();
    let init_repo = repo.clone();
    h.runner.on(
        "docker run --rm --user",
        [flow_reply.with_effect(move |spec| {
            let args = &spec.args;
            let design_at = args.iter().position(|a| a == "-design").unwrap() + 1;
            let design = &args[design_at];
            if args.iter().any(|a| a == "-init_design_config") {
                touch(&init_repo.join("designs").join(design).join("config.json"), "{}");
            } else {
                touch(
                    &repo
                        .join("designs")
                        .join(design)
                        .join("runs/toolrig/reports/metrics.csv"),
                    METRICS,
                );
            }
        })],
    );
}

impl Host {
    fn provision(&self, profile: &EnvironmentProfile, goal: &Goal) -> PipelineReport {
        let log = RunLog::open(&self.layout.log_path(&goal.run_id())).unwrap();
        let invoker = ToolInvoker::new(&self.runner, &log);
        Provisioner::new(&self.config, &self.layout, invoker, &self.clock)
            .with_apt_paths(AptPaths::under(&self.apt_root))
            .with_interrupt_check(never_interrupted)
            .provision(profile, goal)
    }

    fn log_text(&self, goal: &Goal) -> String {
        fs::read_to_string(self.layout.log_path(&goal.run_id())).unwrap()
    }
}

fn bare_linux() -> EnvironmentProfile {
    EnvironmentProfile::new(PlatformKind::BareLinux, true, false)
}

#[test]
fn fresh_host_provisions_and_passes_smoke_test() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    tool_runs_produce_results(&h, Reply::ok("flow complete"));

    let report = h.provision(&bare_linux(), &Goal::SelfTest);
    assert_eq!(report.status, PipelineStatus::Success, "{:?}", report.failure);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.degraded().count(), 0);
    assert_eq!(report.outcomes.len(), 9);

    let inspection = report.outcome("result-inspection").unwrap();
    assert!(inspection.detail.contains("flow_status=flow completed"));
    assert_eq!(h.runner.count("git clone"), 1);
    assert_eq!(h.runner.count("docker pull"), 1);
    assert!(h.root.join("pdks/sky130A").is_dir());

    let log = h.log_text(&Goal::SelfTest);
    assert!(log.contains("mode: docker selected (unprivileged)"));
    assert!(log.contains("stage smoke-test: success"));
}

#[test]
fn second_run_skips_satisfied_stages() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    tool_runs_produce_results(&h, Reply::ok(""));
    assert_eq!(h.provision(&bare_linux(), &Goal::SelfTest).exit_code(), 0);

    let report = h.provision(&bare_linux(), &Goal::SelfTest);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(h.runner.count("git clone"), 1);
    assert_eq!(h.runner.count("docker pull"), 1);
    assert_eq!(h.runner.count("apt-get update"), 1);
    assert_eq!(h.runner.count("apt-get install"), 1);
    assert_eq!(h.runner.count("make pdk"), 1);
    for stage in [
        "package-lock",
        "package-index",
        "host-packages",
        "runtime-repo",
        "container-image",
        "pdk",
        "smoke-test",
    ] {
        assert!(report.outcome(stage).unwrap().skipped, "{stage} was not skipped");
    }
}

#[test]
fn guest_without_runtime_stops_before_fetching() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    let guest = EnvironmentProfile::new(PlatformKind::VirtualizedLinuxGuest, false, false);

    let report = h.provision(&guest, &Goal::SelfTest);
    assert_eq!(report.exit_code(), 3);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.category, FailureCategory::Runtime);
    assert!(failure
        .remediation
        .as_deref()
        .unwrap()
        .contains("WSL integration"));
    assert_eq!(h.runner.count("git clone"), 0);
    assert_eq!(h.runner.count("apt-get install -y docker.io"), 0);
    assert!(report.outcome("runtime-repo").is_none());
}

#[test]
fn broken_mirror_is_healed_once() {
    let h = host("deb http://xx.archive.ubuntu.com/ubuntu jammy main universe\n");
    h.runner.on(
        "apt-get update",
        [
            Reply::fail(
                100,
                "Err:1 http://xx.archive.ubuntu.com/ubuntu jammy InRelease\n\
                 W: Failed to fetch http://xx.archive.ubuntu.com/ubuntu/dists/jammy/InRelease  \
                 Temporary failure resolving 'xx.archive.ubuntu.com'\n",
            ),
            Reply::ok("Reading package lists..."),
        ],
    );
    tool_runs_produce_results(&h, Reply::ok(""));
    let elevated = EnvironmentProfile::new(PlatformKind::BareLinux, true, true);

    let report = h.provision(&elevated, &Goal::SelfTest);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        report.outcome("package-index").unwrap().status,
        StageStatus::Success
    );
    assert_eq!(h.runner.count("apt-get update"), 2);

    let log = h.log_text(&Goal::SelfTest);
    assert_eq!(log.matches("repair: ").count(), 1);
    assert!(log.contains("repair: normalize-mirror-hosts"));
    let sources = fs::read_to_string(AptPaths::under(&h.apt_root).sources_list).unwrap();
    assert_eq!(
        sources,
        "deb http://archive.ubuntu.com/ubuntu jammy main universe\n"
    );
}

#[test]
fn unknown_package_failure_is_fatal() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    h.runner
        .on("apt-get update", [Reply::fail(100, "E: Something new and strange")]);

    let report = h.provision(&bare_linux(), &Goal::SelfTest);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(h.runner.count("apt-get update"), 1);
    assert_eq!(h.runner.count("git clone"), 0);
}

#[test]
fn elevated_mode_is_used_for_every_later_container_command() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    h.runner.on(
        "docker run --rm hello-world",
        [
            Reply::fail(126, "permission denied while trying to connect to the Docker daemon socket"),
            Reply::fail(126, "permission denied while trying to connect to the Docker daemon socket"),
            Reply::ok("Hello from Docker!"),
        ],
    );
    tool_runs_produce_results(&h, Reply::ok(""));

    let report = h.provision(&bare_linux(), &Goal::SelfTest);
    assert_eq!(report.exit_code(), 0, "{:?}", report.failure);
    assert!(h
        .log_text(&Goal::SelfTest)
        .contains("mode: docker selected (elevated)"));

    let calls = h.runner.calls();
    let selected = calls
        .iter()
        .rposition(|c| c.command_line() == "docker run --rm hello-world")
        .unwrap();
    let later: Vec<_> = calls[selected + 1..]
        .iter()
        .filter(|c| c.program == "docker" || c.program == "make")
        .collect();
    assert!(later.len() >= 3);
    assert!(later.iter().all(|c| c.elevated), "mixed execution modes");
}

#[test]
fn held_package_lock_times_out_after_one_retry() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    // fuser always finds a holder.
    let h = {
        let runner = ScriptedRunner::new();
        runner.on("fuser", [Reply::ok("/var/lib/dpkg/lock-frontend: 4242")]);
        Host { runner, ..h }
    };

    let report = h.provision(&bare_linux(), &Goal::SelfTest);
    assert_eq!(report.exit_code(), 5);
    let outcome = report.outcome("package-lock").unwrap();
    assert_eq!(outcome.status, StageStatus::Failed);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(h.runner.count("apt-get"), 0);
    let log = h.log_text(&Goal::SelfTest);
    assert!(log.contains("stage package-lock: retry"));
    assert!(log.contains("exec: [elevated] fuser /var/lib/dpkg/lock-frontend"));
    assert!(log.contains("exit: fuser (ok)"));
}

#[test]
fn unsupported_host_fails_before_any_stage() {
    let h = host("");
    let mut profile = EnvironmentProfile::new(PlatformKind::Unsupported, false, false);
    profile.unsupported_reason = Some("WSL 1 is not supported".to_owned());

    let report = h.provision(&profile, &Goal::SelfTest);
    assert_eq!(report.exit_code(), 1);
    assert!(report.outcomes.is_empty());
    assert!(h.runner.calls().is_empty());
}

#[test]
fn failed_flow_with_result_is_degraded() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    tool_runs_produce_results(&h, Reply::fail(2, "[ERROR]: LVS mismatch"));

    let report = h.provision(&bare_linux(), &Goal::SelfTest);
    assert_eq!(report.exit_code(), 0);
    let smoke = report.outcome("smoke-test").unwrap();
    assert_eq!(smoke.status, StageStatus::Degraded);
    assert!(smoke.detail.contains("exit 2"));
}

#[test]
fn flow_without_result_is_a_tool_failure() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    h.runner.on(
        "docker run --rm --user",
        [Reply::fail(1, "[ERROR]: synthesis failed")],
    );

    let report = h.provision(&bare_linux(), &Goal::SelfTest);
    assert_eq!(report.exit_code(), 6);
    assert!(report.outcome("result-inspection").is_none());
    let log = h.log_text(&Goal::SelfTest);
    assert!(log.contains("[ERROR]: synthesis failed"));
}

#[test]
fn batch_design_run_prepares_area_then_runs_flow() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    tool_runs_produce_results(&h, Reply::ok(""));
    let goal = Goal::design("picorv32a", DesignMode::Batch).unwrap();

    let report = h.provision(&bare_linux(), &goal);
    assert_eq!(report.exit_code(), 0, "{:?}", report.failure);
    assert!(h.layout.design_dir("picorv32a").join("config.json").is_file());
    assert_eq!(
        report.outcome("design-flow").unwrap().status,
        StageStatus::Success
    );
    assert!(h.root.join("toolrig-design-picorv32a.log").is_file());
}

#[test]
fn invalid_design_area_is_moved_aside() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    tool_runs_produce_results(&h, Reply::ok(""));
    let goal = Goal::design("picorv32a", DesignMode::Batch).unwrap();
    assert_eq!(h.provision(&bare_linux(), &goal).exit_code(), 0);

    // Lose the design config but keep the rest of the area.
    let area = h.layout.design_dir("picorv32a");
    fs::remove_file(area.join("config.json")).unwrap();
    touch(&area.join("notes.txt"), "half-finished");

    let report = h.provision(&bare_linux(), &goal);
    assert_eq!(report.exit_code(), 0, "{:?}", report.failure);
    assert_eq!(h.runner.count("git clone"), 1);
    assert!(area.join("config.json").is_file());
    assert!(!area.join("notes.txt").exists());
    assert!(h.log_text(&goal).contains("moved invalid design area"));

    let stale: Vec<PathBuf> = fs::read_dir(area.parent().unwrap())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("picorv32a.stale-")
        })
        .collect();
    assert_eq!(stale.len(), 1);
    assert!(stale[0].join("notes.txt").is_file());
}

#[test]
fn interactive_session_runs_with_a_terminal() {
    let h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    tool_runs_produce_results(&h, Reply::ok(""));
    let goal = Goal::design("spm", DesignMode::Interactive).unwrap();

    let report = h.provision(&bare_linux(), &goal);
    assert_eq!(report.exit_code(), 0);
    let session = h
        .runner
        .calls()
        .into_iter()
        .find(|c| c.args.iter().any(|a| a == "-interactive"))
        .unwrap();
    assert!(session.interactive);
    assert!(session.args.iter().any(|a| a == "-it"));
}

#[test]
fn unpinned_image_is_rejected_before_any_command() {
    let mut h = host("deb http://archive.ubuntu.com/ubuntu jammy main\n");
    h.config.image = "efabless/openlane:latest".to_owned();

    let report = h.provision(&bare_linux(), &Goal::SelfTest);
    assert_eq!(report.exit_code(), 7);
    assert!(h.runner.calls().is_empty());
}
