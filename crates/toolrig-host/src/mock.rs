use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Effect = Arc<dyn Fn(&CommandSpec) + Send + Sync>;

/// A canned response for one scripted command invocation.
#[derive(Clone)]
pub struct Reply {
    outcome: Result<CommandOutput, String>,
    effect: Option<Effect>,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Self {
            outcome: Ok(CommandOutput {
                code: Some(0),
                stdout: stdout.to_owned(),
                stderr: String::new(),
            }),
            effect: None,
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Self {
            outcome: Ok(CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: stderr.to_owned(),
            }),
            effect: None,
        }
    }

    /// The program could not be started at all.
    pub fn spawn_error(message: &str) -> Self {
        Self {
            outcome: Err(message.to_owned()),
            effect: None,
        }
    }

    /// Side effect applied to the host when this reply is served, e.g. a
    /// `git clone` creating files in its destination.
    #[must_use]
    pub fn with_effect(mut self, effect: impl Fn(&CommandSpec) + Send + Sync + 'static) -> Self {
        self.effect = Some(Arc::new(effect));
        self
    }
}

struct Rule {
    prefix: String,
    replies: Vec<Reply>,
    served: usize,
}

/// Command runner driven by a script instead of the host.
///
/// Rules match on the command line prefix (`program args...`, no privilege
/// prefix), first registered rule wins. Each rule serves its replies in
/// order and keeps repeating the last one. Commands no rule matches succeed
/// with empty output. Every call is recorded.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
    missing: Mutex<HashSet<String>>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<I>(&self, prefix: &str, replies: I)
    where
        I: IntoIterator<Item = Reply>,
    {
        locked(&self.rules).push(Rule {
            prefix: prefix.to_owned(),
            replies: replies.into_iter().collect(),
            served: 0,
        });
    }

    /// Make `exists(program)` report false.
    pub fn set_missing(&self, program: &str) {
        locked(&self.missing).insert(program.to_owned());
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        locked(&self.calls).clone()
    }

    /// Number of recorded calls whose command line starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        locked(&self.calls)
            .iter()
            .filter(|c| c.command_line().starts_with(prefix))
            .count()
    }

    fn next_reply(&self, line: &str) -> Option<Reply> {
        let mut rules = locked(&self.rules);
        let rule = rules.iter_mut().find(|r| line.starts_with(&r.prefix))?;
        if rule.replies.is_empty() {
            return None;
        }
        let idx = rule.served.min(rule.replies.len() - 1);
        rule.served += 1;
        Some(rule.replies[idx].clone())
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        locked(&self.calls).push(spec.clone());
        let Some(reply) = self.next_reply(&spec.command_line()) else {
            return Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            });
        };
        if let Some(effect) = reply.effect {
            effect(spec);
        }
        reply.outcome.map_err(|msg| ExecError::Spawn {
            program: spec.program.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, msg),
        })
    }

    fn exists(&self, program: &str) -> bool {
        !locked(&self.missing).contains(program)
    }
}
