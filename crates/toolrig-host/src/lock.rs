use crate::exec::{CommandSpec, ExecError};
use crate::invoke::ToolInvoker;
use crate::retry::{Clock, RetryPolicy};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
#[error("lock '{lock_id}' still held after {}s", waited.as_secs())]
pub struct LockTimeout {
    pub lock_id: String,
    pub waited: Duration,
}

impl LockTimeout {
    pub fn remediation(&self) -> String {
        format!(
            "free the package lock: wait for the running package manager (often unattended-upgrades) \
             to finish, or inspect the holder with `sudo fuser -v {}`",
            self.lock_id
        )
    }
}

/// Reports whether some other process currently owns a lock.
pub trait LockProbe {
    fn is_held(&self, lock_id: &str) -> Result<bool, ExecError>;
}

/// Probes lock files with `fuser`, which exits 0 when any process has the
/// file open and 1 when none does. Each probe lands in the run log.
pub struct FuserProbe<'a> {
    invoker: ToolInvoker<'a>,
    elevated: bool,
}

impl<'a> FuserProbe<'a> {
    pub fn new(invoker: ToolInvoker<'a>, elevated: bool) -> Self {
        Self { invoker, elevated }
    }
}

impl LockProbe for FuserProbe<'_> {
    fn is_held(&self, lock_id: &str) -> Result<bool, ExecError> {
        let out = self.invoker.invoke(
            &CommandSpec::new("fuser")
                .arg(lock_id)
                .elevated(self.elevated)
                .timeout(Some(Duration::from_secs(10))),
        )?;
        Ok(out.success())
    }
}

/// Wait cooperatively until `lock_id` is free.
///
/// Polls at the policy's first backoff delay and gives up once the elapsed
/// wait reaches `per_attempt_timeout` (or attempts × interval when unset;
/// a product too large for a `Duration` means no bound).
/// Never touches the lock itself. A probe that cannot run is treated as
/// "free": the package manager will then report the contention itself.
pub fn wait_for_lock(
    lock_id: &str,
    policy: &RetryPolicy,
    probe: &dyn LockProbe,
    clock: &dyn Clock,
) -> Result<Duration, LockTimeout> {
    let interval = policy.backoff.delay_after(1).max(Duration::from_millis(1));
    let bound = match policy.per_attempt_timeout() {
        Some(limit) => Some(limit),
        None => interval.checked_mul(policy.attempts()),
    };
    let started = clock.now();
    let mut announced = false;

    loop {
        let waited = clock.now().saturating_sub(started);
        match probe.is_held(lock_id) {
            Ok(false) => {
                if announced {
                    info!("lock {lock_id} released after {}s", waited.as_secs());
                }
                return Ok(waited);
            }
            Ok(true) => {}
            Err(e) => {
                warn!("cannot probe lock {lock_id} ({e}); continuing without waiting");
                return Ok(waited);
            }
        }

        if bound.is_some_and(|b| waited >= b) {
            return Err(LockTimeout {
                lock_id: lock_id.to_owned(),
                waited,
            });
        }
        if !announced {
            info!("waiting for {lock_id} to be released...");
            announced = true;
        }
        debug!("{lock_id} held; polling again in {interval:?}");
        let pause = bound.map_or(interval, |b| interval.min(b.saturating_sub(waited)));
        clock.sleep(pause);
    }
}
