/// Bounded retry with a configurable delay schedule.
///
/// Used for broker connects and database pool start-up. The delay between
/// attempts is taken from a `Backoff` schedule and slept through a `Sleeper`
/// so tests can run a full retry cycle without waiting.

use std::fmt::Display;
use std::time::Duration;
use tracing::{error, info};

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay after every failed attempt.
    Fixed(Duration),
    /// `initial * 2^(attempt-1)`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

/// Something that can wait. Real code uses `ThreadSleeper`.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// 10 attempts, 5 seconds apart.
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::Fixed(Duration::from_secs(5)),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, backoff: Backoff::Fixed(delay) }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    /// Runs `op` until it succeeds or `max_attempts` is exhausted, returning
    /// the last error in the latter case. `what` names the operation in logs.
    pub fn run<T, E, F>(&self, what: &str, sleeper: &dyn Sleeper, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    error!(attempt, max_attempts, "{} attempt failed: {}", what, e);
                    if attempt >= max_attempts {
                        error!("Max retries reached. Could not complete {}", what);
                        return Err(e);
                    }
                    let delay = self.delay_after(attempt);
                    info!("Retrying {} in {:?}", what, delay);
                    sleeper.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Records requested delays instead of sleeping.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    pub slept: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
