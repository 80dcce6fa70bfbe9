use crate::concurrency::shutdown_requested;
use crate::failure::{FailureCategory, StageError};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use toolrig_host::Clock;
use toolrig_workspace::RunLog;
use tracing::{debug, info, warn};

/// What the orchestrator does when a stage does not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Fatal,
    DegradeAndContinue,
    /// Run the stage once more, then treat as `Fatal`.
    RetryThenFatal,
}

/// Result of a stage action that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    Done,
    /// Succeeded; the detail is surfaced in the outcome.
    Summary(String),
    /// Completed with a usable but imperfect result.
    Degraded(String),
}

/// One pipeline stage. Declared statically; never mutated at runtime.
pub struct StageDescriptor<C> {
    pub name: &'static str,
    /// True when the stage's effect is already present.
    pub idempotency_check: fn(&C) -> bool,
    pub action: fn(&mut C) -> Result<ActionStatus, StageError>,
    pub failure_policy: FailurePolicy,
}

impl<C> StageDescriptor<C> {
    pub const fn new(
        name: &'static str,
        idempotency_check: fn(&C) -> bool,
        action: fn(&mut C) -> Result<ActionStatus, StageError>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            name,
            idempotency_check,
            action,
            failure_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Degraded,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: &'static str,
    pub status: StageStatus,
    pub detail: String,
    #[serde(serialize_with = "serialize_millis", rename = "duration_ms")]
    pub duration: Duration,
    /// Satisfied by the idempotency check; the action did not run.
    pub skipped: bool,
    pub attempts: u32,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub status: PipelineStatus,
    pub outcomes: Vec<StageOutcome>,
    /// The error that stopped the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageError>,
}

impl PipelineReport {
    /// A pipeline that failed before its first stage.
    pub fn aborted(failure: StageError) -> Self {
        Self {
            status: PipelineStatus::Failed,
            outcomes: Vec::new(),
            failure: Some(failure),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match (&self.status, &self.failure) {
            (PipelineStatus::Success, _) => 0,
            (PipelineStatus::Failed, Some(e)) => e.category.exit_code(),
            (PipelineStatus::Failed, None) => 1,
        }
    }

    pub fn degraded(&self) -> impl Iterator<Item = &StageOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == StageStatus::Degraded)
    }

    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.stage == stage)
    }
}

/// Progress hooks for front ends.
pub trait StageObserver {
    fn stage_started(&self, _stage: &str) {}
    fn stage_finished(&self, _outcome: &StageOutcome) {}
}

pub struct NoopObserver;

impl StageObserver for NoopObserver {}

/// Runs stages strictly in declared order and owns every continue, degrade
/// or abort decision.
pub struct Orchestrator<'a> {
    log: &'a RunLog,
    clock: &'a dyn Clock,
    observer: &'a dyn StageObserver,
    interrupted: fn() -> bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(log: &'a RunLog, clock: &'a dyn Clock) -> Self {
        Self {
            log,
            clock,
            observer: &NoopObserver,
            interrupted: shutdown_requested,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: &'a dyn StageObserver) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_interrupt_check(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }

    pub fn run<C>(&self, pipeline: &[StageDescriptor<C>], ctx: &mut C) -> PipelineReport {
        let mut outcomes = Vec::with_capacity(pipeline.len());

        for stage in pipeline {
            if (self.interrupted)() {
                self.log
                    .record(&format!("pipeline interrupted before stage {}", stage.name));
                return PipelineReport {
                    status: PipelineStatus::Failed,
                    outcomes,
                    failure: Some(StageError::new(
                        FailureCategory::Interrupted,
                        format!("interrupted before stage {}", stage.name),
                    )),
                };
            }

            self.observer.stage_started(stage.name);
            let (outcome, failure) = self.run_stage(stage, ctx);
            self.observer.stage_finished(&outcome);
            outcomes.push(outcome);

            if let Some(failure) = failure {
                return PipelineReport {
                    status: PipelineStatus::Failed,
                    outcomes,
                    failure: Some(failure),
                };
            }
        }

        PipelineReport {
            status: PipelineStatus::Success,
            outcomes,
            failure: None,
        }
    }

    fn run_stage<C>(
        &self,
        stage: &StageDescriptor<C>,
        ctx: &mut C,
    ) -> (StageOutcome, Option<StageError>) {
        if (stage.idempotency_check)(ctx) {
            debug!("stage {} already satisfied", stage.name);
            self.log.record(&format!("stage {}: skip", stage.name));
            return (
                StageOutcome {
                    stage: stage.name,
                    status: StageStatus::Success,
                    detail: "already satisfied".to_owned(),
                    duration: Duration::ZERO,
                    skipped: true,
                    attempts: 0,
                },
                None,
            );
        }

        info!("stage {}", stage.name);
        self.log.record(&format!("stage {}: start", stage.name));
        let started = self.clock.now();
        let mut attempts = 1;
        let mut result = (stage.action)(ctx);

        if stage.failure_policy == FailurePolicy::RetryThenFatal {
            if let Err(e) = result {
                if e.category == FailureCategory::Interrupted {
                    result = Err(e);
                } else {
                    warn!("stage {} failed ({e}); retrying once", stage.name);
                    self.log
                        .record(&format!("stage {}: retry ({e})", stage.name));
                    attempts = 2;
                    result = (stage.action)(ctx);
                }
            }
        }

        let duration = self.clock.now().saturating_sub(started);
        let outcome = |status, detail: String| StageOutcome {
            stage: stage.name,
            status,
            detail,
            duration,
            skipped: false,
            attempts,
        };

        match result {
            Ok(ActionStatus::Done) => {
                self.log.record(&format!("stage {}: success", stage.name));
                (outcome(StageStatus::Success, "ok".to_owned()), None)
            }
            Ok(ActionStatus::Summary(detail)) => {
                self.log
                    .record(&format!("stage {}: success ({detail})", stage.name));
                (outcome(StageStatus::Success, detail), None)
            }
            Ok(ActionStatus::Degraded(detail)) => {
                warn!("stage {} degraded: {detail}", stage.name);
                self.log
                    .record(&format!("stage {}: degraded ({detail})", stage.name));
                (outcome(StageStatus::Degraded, detail), None)
            }
            Err(e)
                if stage.failure_policy == FailurePolicy::DegradeAndContinue
                    && e.category != FailureCategory::Interrupted =>
            {
                warn!("stage {} degraded: {e}", stage.name);
                self.log
                    .record(&format!("stage {}: degraded ({e})", stage.name));
                (outcome(StageStatus::Degraded, e.to_string()), None)
            }
            Err(e) => {
                self.log
                    .record(&format!("stage {}: failed ({e})", stage.name));
                (outcome(StageStatus::Failed, e.to_string()), Some(e))
            }
        }
    }
}
