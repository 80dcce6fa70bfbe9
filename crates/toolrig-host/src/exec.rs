use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' timed out after {}s", after.as_secs())]
    Timeout { program: String, after: Duration },
    #[error("command I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One external command, described independently of how it gets run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    pub elevated: bool,
    pub interactive: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    #[must_use]
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// `program arg1 arg2 ...` without any privilege prefix.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr; failure signatures may appear in either.
    pub fn combined(&self) -> String {
        let mut all = self.stdout.clone();
        if !all.is_empty() && !all.ends_with('\n') {
            all.push('\n');
        }
        all.push_str(&self.stderr);
        all
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;

    /// Whether `program` resolves on `PATH`.
    fn exists(&self, program: &str) -> bool;
}

/// Runs commands on the real host.
pub struct SystemRunner {
    already_root: bool,
}

impl SystemRunner {
    pub fn new(already_root: bool) -> Self {
        Self { already_root }
    }

    fn build(&self, spec: &CommandSpec) -> Command {
        let mut cmd = if spec.elevated && !self.already_root {
            let mut c = Command::new("sudo");
            if !spec.env.is_empty() {
                // sudo resets the environment; hand variables through env(1).
                c.arg("env");
                for (k, v) in &spec.env {
                    c.arg(format!("{k}={v}"));
                }
            }
            c.arg(&spec.program);
            c
        } else {
            let mut c = Command::new(&spec.program);
            for (k, v) in &spec.env {
                c.env(k, v);
            }
            c
        };
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        debug!("running: {}", spec.command_line());
        let mut cmd = self.build(spec);
        let spawn_err = |source| ExecError::Spawn {
            program: spec.program.clone(),
            source,
        };

        if spec.interactive {
            let status = cmd
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(spawn_err)?;
            return Ok(CommandOutput {
                code: status.code(),
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn().map_err(spawn_err)?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        // Fed from its own thread so a child echoing its input never blocks
        // on a full stdout pipe while we block on its stdin.
        let feeder = match (spec.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(std::thread::spawn(move || {
                pipe.write_all(input.as_bytes())
            })),
            _ => None,
        };

        let code = wait_with_timeout(&mut child, spec.timeout).map_err(|e| match e {
            WaitError::TimedOut(after) => ExecError::Timeout {
                program: spec.program.clone(),
                after,
            },
            WaitError::Io(e) => ExecError::Io(e),
        })?;
        if let Some(Ok(Err(e))) = feeder.map(JoinHandle::join) {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(ExecError::Io(e));
            }
        }

        Ok(CommandOutput {
            code,
            stdout: join_drain(stdout),
            stderr: join_drain(stderr),
        })
    }

    fn exists(&self, program: &str) -> bool {
        Command::new("which")
            .arg(program)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

enum WaitError {
    TimedOut(Duration),
    Io(std::io::Error),
}

fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> Result<Option<i32>, WaitError> {
    let Some(limit) = timeout else {
        return child.wait().map(|s| s.code()).map_err(WaitError::Io);
    };
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(WaitError::Io)? {
            return Ok(status.code());
        }
        if started.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            return Err(WaitError::TimedOut(limit));
        }
        std::thread::sleep(WAIT_POLL);
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut r| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_drain(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
