use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};
use std::fmt;
use toolrig_workspace::RunLog;
use tracing::debug;

/// How an external command's exit should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInterpretation {
    Success,
    Failed(i32),
    /// Terminated by a signal.
    Killed,
}

impl ExitInterpretation {
    pub fn of(output: &CommandOutput) -> Self {
        match output.code {
            Some(0) => Self::Success,
            Some(code) => Self::Failed(code),
            None => Self::Killed,
        }
    }
}

impl fmt::Display for ExitInterpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "ok"),
            Self::Failed(code) => write!(f, "exit {code}"),
            Self::Killed => write!(f, "killed by signal"),
        }
    }
}

/// Runs external commands with uniform run-log capture.
///
/// Every command executed on behalf of a stage goes through here so the run
/// log holds the command line, its verbatim output, and how it ended.
#[derive(Clone, Copy)]
pub struct ToolInvoker<'a> {
    runner: &'a dyn CommandRunner,
    log: &'a RunLog,
}

impl<'a> ToolInvoker<'a> {
    pub fn new(runner: &'a dyn CommandRunner, log: &'a RunLog) -> Self {
        Self { runner, log }
    }

    pub fn log(&self) -> &'a RunLog {
        self.log
    }

    pub fn invoke(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let prefix = if spec.elevated { "[elevated] " } else { "" };
        self.log
            .record(&format!("exec: {prefix}{}", spec.command_line()));

        match self.runner.run(spec) {
            Ok(output) => {
                self.log.capture("stdout", &output.stdout);
                self.log.capture("stderr", &output.stderr);
                let verdict = ExitInterpretation::of(&output);
                self.log
                    .record(&format!("exit: {} ({verdict})", spec.program));
                debug!("{} -> {verdict}", spec.command_line());
                Ok(output)
            }
            Err(e) => {
                self.log.record(&format!("exit: {} (error: {e})", spec.program));
                Err(e)
            }
        }
    }

    /// Run and report success, treating a spawn failure as failure.
    pub fn succeeds(&self, spec: &CommandSpec) -> bool {
        self.invoke(spec).is_ok_and(|o| o.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Reply, ScriptedRunner};

    #[test]
    fn interpretation_of_codes() {
        let ok = CommandOutput {
            code: Some(0),
            ..CommandOutput::default()
        };
        let failed = CommandOutput {
            code: Some(2),
            ..CommandOutput::default()
        };
        let killed = CommandOutput::default();
        assert_eq!(ExitInterpretation::of(&ok), ExitInterpretation::Success);
        assert_eq!(ExitInterpretation::of(&failed), ExitInterpretation::Failed(2));
        assert_eq!(ExitInterpretation::of(&killed), ExitInterpretation::Killed);
    }

    #[test]
    fn invoke_records_command_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::open(&dir.path().join("t.log")).unwrap();
        let runner = ScriptedRunner::new();
        runner.on("make pdk", [Reply::fail(2, "volare: network unreachable")]);

        let invoker = ToolInvoker::new(&runner, &log);
        let out = invoker
            .invoke(&CommandSpec::new("make").arg("pdk"))
            .unwrap();
        assert_eq!(out.code, Some(2));

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("exec: make pdk"));
        assert!(content.contains("volare: network unreachable"));
        assert!(content.contains("exit: make (exit 2)"));
    }

    #[test]
    fn elevated_commands_are_marked() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::open(&dir.path().join("t.log")).unwrap();
        let runner = ScriptedRunner::new();
        let invoker = ToolInvoker::new(&runner, &log);
        assert!(invoker.succeeds(&CommandSpec::new("apt-get").arg("update").elevated(true)));
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("exec: [elevated] apt-get update"));
    }
}
