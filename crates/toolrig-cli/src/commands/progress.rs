use super::{colorize_status, spin_fail, spin_ok, spinner};
use indicatif::ProgressBar;
use std::cell::RefCell;
use std::io::{stderr, IsTerminal};
use toolrig_core::{StageObserver, StageOutcome, StageStatus};

/// Stages that take over the terminal and must not run under a spinner.
const TERMINAL_STAGES: &[&str] = &["interactive-session"];

/// Per-stage progress on stderr: spinners on a terminal, plain lines
/// otherwise, nothing in JSON mode.
pub struct Progress {
    enabled: bool,
    animated: bool,
    current: RefCell<Option<ProgressBar>>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            animated: enabled && stderr().is_terminal(),
            current: RefCell::new(None),
        }
    }

    /// Clear a spinner left running by an interrupted stage.
    pub fn finish(&self) {
        if let Some(pb) = self.current.borrow_mut().take() {
            pb.finish_and_clear();
        }
    }
}

impl StageObserver for Progress {
    fn stage_started(&self, stage: &str) {
        if !self.enabled {
            return;
        }
        if TERMINAL_STAGES.contains(&stage) {
            eprintln!("{stage}: attaching terminal (exit the tool shell to finish)");
            return;
        }
        if self.animated {
            *self.current.borrow_mut() = Some(spinner(stage));
        }
    }

    fn stage_finished(&self, outcome: &StageOutcome) {
        if !self.enabled {
            return;
        }
        let status = colorize_status(outcome.status, outcome.skipped);
        let line = if outcome.skipped || outcome.detail == "ok" {
            format!("{} {status}", outcome.stage)
        } else {
            format!("{} {status} ({})", outcome.stage, outcome.detail)
        };
        match self.current.borrow_mut().take() {
            Some(pb) if outcome.status == StageStatus::Failed => spin_fail(&pb, &line),
            Some(pb) => spin_ok(&pb, &line),
            None => eprintln!("{line}"),
        }
    }
}
