//! Provisioning orchestration for toolrig.
//!
//! This crate ties the host components and the workspace state together into
//! the `Orchestrator`, which runs an ordered list of `StageDescriptor`s with
//! skip-if-satisfied idempotency checks and per-stage failure policies, and
//! the `Provisioner`, which declares the standard provisioning pipelines. It
//! also provides TOML configuration, the workspace process lock, interrupt
//! handling, and the mapping from failures to stable exit codes.

pub mod concurrency;
pub mod config;
pub mod failure;
pub mod pipeline;
pub mod stages;

pub use concurrency::{install_signal_handler, shutdown_requested, WorkspaceLock};
pub use config::{default_workspace_root, ConfigError, ImageRef, ProvisionConfig};
pub use failure::{FailureCategory, StageError};
pub use pipeline::{
    ActionStatus, FailurePolicy, NoopObserver, Orchestrator, PipelineReport, PipelineStatus,
    StageDescriptor, StageObserver, StageOutcome, StageStatus,
};
pub use stages::{check_supported, DesignMode, Goal, ProvisionContext, Provisioner};

use thiserror::Error;
use toolrig_workspace::WorkspaceError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("workspace {0} is in use by another toolrig process")]
    WorkspaceBusy(String),
    #[error("invalid design mode '{0}' (expected 1 or 2)")]
    InvalidMode(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Config(_)
            | Self::InvalidMode(_)
            | Self::Workspace(WorkspaceError::InvalidDesignId(_)) => FailureCategory::Config,
            Self::Workspace(_) | Self::WorkspaceBusy(_) | Self::Io(_) => {
                FailureCategory::Workspace
            }
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }
}

impl From<CoreError> for StageError {
    fn from(e: CoreError) -> Self {
        let category = e.category();
        match e {
            CoreError::Config(inner) => inner.into(),
            CoreError::Workspace(inner) => Self::new(category, inner.to_string()),
            CoreError::WorkspaceBusy(root) => Self::new(
                category,
                format!("workspace {root} is in use by another toolrig process"),
            )
            .with_remediation("wait for the other run to finish, or pass a different --workspace"),
            CoreError::InvalidMode(_) => Self::new(category, e.to_string())
                .with_remediation("answer 1 (full flow) or 2 (interactive)"),
            CoreError::Io(inner) => Self::new(category, inner.to_string()),
        }
    }
}
