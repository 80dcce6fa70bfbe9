use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use toolrig_host::{ExecError, FetchError, LockTimeout, PackageStateError, RuntimeError};
use toolrig_workspace::WorkspaceError;

/// Failure classes with a stable process exit code each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    UnsupportedEnvironment,
    PackageState,
    Runtime,
    Network,
    LockTimeout,
    Tool,
    Config,
    Workspace,
    Interrupted,
}

impl FailureCategory {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::UnsupportedEnvironment => 1,
            Self::PackageState => 2,
            Self::Runtime => 3,
            Self::Network => 4,
            Self::LockTimeout => 5,
            Self::Tool => 6,
            Self::Config => 7,
            Self::Workspace => 8,
            Self::Interrupted => 130,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnsupportedEnvironment => "unsupported environment",
            Self::PackageState => "package state",
            Self::Runtime => "container runtime",
            Self::Network => "network",
            Self::LockTimeout => "lock timeout",
            Self::Tool => "tool",
            Self::Config => "config",
            Self::Workspace => "workspace",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// A stage's failure as reported to the orchestrator.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{category}: {message}")]
pub struct StageError {
    pub category: FailureCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl StageError {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            remediation: None,
        }
    }

    #[must_use]
    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(FailureCategory::Tool, message)
    }
}

impl From<LockTimeout> for StageError {
    fn from(e: LockTimeout) -> Self {
        Self::new(FailureCategory::LockTimeout, e.to_string()).with_remediation(e.remediation())
    }
}

impl From<PackageStateError> for StageError {
    fn from(e: PackageStateError) -> Self {
        Self::new(FailureCategory::PackageState, e.to_string()).with_remediation(e.remediation())
    }
}

impl From<RuntimeError> for StageError {
    fn from(e: RuntimeError) -> Self {
        Self::new(FailureCategory::Runtime, e.to_string()).with_remediation(e.remediation())
    }
}

impl From<FetchError> for StageError {
    fn from(e: FetchError) -> Self {
        let category = match e {
            FetchError::NetworkExhausted { .. } => FailureCategory::Network,
            FetchError::Workspace(_) | FetchError::Io(_) | FetchError::Serialization(_) => {
                FailureCategory::Workspace
            }
        };
        Self::new(category, e.to_string()).with_remediation(e.remediation())
    }
}

impl From<WorkspaceError> for StageError {
    fn from(e: WorkspaceError) -> Self {
        Self::new(FailureCategory::Workspace, e.to_string())
    }
}

impl From<ExecError> for StageError {
    fn from(e: ExecError) -> Self {
        Self::tool(e.to_string())
    }
}

impl From<ConfigError> for StageError {
    fn from(e: ConfigError) -> Self {
        Self::new(FailureCategory::Config, e.to_string())
    }
}

impl From<std::io::Error> for StageError {
    fn from(e: std::io::Error) -> Self {
        Self::new(FailureCategory::Workspace, e.to_string())
    }
}
