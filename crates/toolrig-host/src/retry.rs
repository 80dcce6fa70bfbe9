use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Linear { initial_ms: u64, step_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let n = u64::from(attempt.max(1) - 1);
        let ms = match *self {
            Self::Fixed { delay_ms } => delay_ms,
            Self::Linear {
                initial_ms,
                step_ms,
            } => initial_ms.saturating_add(step_ms.saturating_mul(n)),
            Self::Exponential { initial_ms, max_ms } => {
                let factor = 1u64.checked_shl(n.min(63) as u32).unwrap_or(u64::MAX);
                initial_ms.saturating_mul(factor).min(max_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    #[serde(default)]
    pub per_attempt_timeout_secs: Option<u64>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
            per_attempt_timeout_secs: None,
        }
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.per_attempt_timeout_secs = Some(secs);
        self
    }

    /// Attempts actually made; a configured zero still tries once.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn per_attempt_timeout(&self) -> Option<Duration> {
        self.per_attempt_timeout_secs.map(Duration::from_secs)
    }
}

/// Time source for everything that waits.
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: `sleep` advances time instantly and is recorded.
#[derive(Default)]
pub struct ManualClock {
    now_nanos: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.now_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
    }
}

/// All attempts failed; carries the last error.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Run `op` up to `policy.attempts()` times, sleeping the backoff delay
/// between failures. `op` receives the 1-based attempt number; `on_failure`
/// sees each failure before the sleep.
pub fn retry<T, E>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut op: impl FnMut(u32) -> Result<T, E>,
    mut on_failure: impl FnMut(u32, &E),
) -> Result<T, Exhausted<E>> {
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) => {
                on_failure(attempt, &e);
                if attempt >= attempts {
                    return Err(Exhausted { attempts, last: e });
                }
                clock.sleep(policy.backoff.delay_after(attempt));
                attempt += 1;
            }
        }
    }
}
