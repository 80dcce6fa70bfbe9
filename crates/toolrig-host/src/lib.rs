//! Host-facing provisioning components for toolrig.
//!
//! This crate implements everything that touches the machine being
//! provisioned: the `CommandRunner` execution seam and the logging
//! `ToolInvoker` adapter, the environment profiler, prerequisite checks,
//! retry/backoff with an injectable `Clock`, the cooperative package-lock
//! waiter, the apt `PackageHealer`, the container runtime gate with its
//! explicit `ExecutionMode`, and the network-resilient repository fetcher.
//! `mock::ScriptedRunner` stands in for the host in tests.

pub mod container;
pub mod exec;
pub mod fetch;
pub mod invoke;
pub mod lock;
pub mod mock;
pub mod packages;
pub mod prereq;
pub mod profile;
pub mod retry;

pub use container::{
    ContainerInvocation, ContainerRun, ExecutionMode, RuntimeError, RuntimeGate, RuntimeSettings,
};
pub use exec::{CommandOutput, CommandRunner, CommandSpec, ExecError, SystemRunner};
pub use fetch::{
    FetchError, FetchReport, FetchStrategy, Fetcher, GitTransport, ResourceRef, Transport,
};
pub use invoke::{ExitInterpretation, ToolInvoker};
pub use lock::{wait_for_lock, FuserProbe, LockProbe, LockTimeout};
pub use packages::{AptPaths, HealReport, HealerSettings, PackageHealer, PackageStateError, Repair};
pub use prereq::{check_host_prereqs, format_missing, MissingPrereq};
pub use profile::{classify, EnvironmentProfile, HostSignals, PlatformKind};
pub use retry::{retry, Backoff, Clock, Exhausted, ManualClock, RetryPolicy, SystemClock};
