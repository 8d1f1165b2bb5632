//! Bounded exponential backoff for calls that may fail transiently.
//!
//! Only errors carrying a transient `ExitError` are retried; everything else
//! is returned on the first failure. Sleeps block the calling thread.

use std::time::Duration;

use crate::error::{self, ExitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl Backoff {
    /// A policy that never sleeps, for tests and dry runs.
    pub const fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry);
        self.initial_delay.saturating_mul(factor)
    }

    /// Run `op`, retrying transient failures with exponential delays.
    pub fn run<T>(&self, what: &str, op: impl FnMut() -> anyhow::Result<T>) -> anyhow::Result<T> {
        self.run_with_sleep(what, op, std::thread::sleep)
    }

    /// Like `run`, for writes that must not be repeated. Before each retry
    /// `landed` checks whether the failed attempt took effect anyway (a
    /// timeout after the server accepted it) and its answer is returned
    /// instead of writing again.
    pub fn run_write<T>(
        &self,
        what: &str,
        attempt: impl FnMut() -> anyhow::Result<T>,
        landed: impl FnMut() -> anyhow::Result<Option<T>>,
    ) -> anyhow::Result<T> {
        self.run_write_with_sleep(what, attempt, landed, std::thread::sleep)
    }

    pub(crate) fn run_write_with_sleep<T>(
        &self,
        what: &str,
        mut attempt: impl FnMut() -> anyhow::Result<T>,
        mut landed: impl FnMut() -> anyhow::Result<Option<T>>,
        sleep: impl FnMut(Duration),
    ) -> anyhow::Result<T> {
        let mut tried = false;
        self.run_with_sleep(
            what,
            || {
                if std::mem::replace(&mut tried, true) {
                    if let Some(value) = landed()? {
                        tracing::info!(operation = what, "earlier attempt landed, not repeating");
                        return Ok(value);
                    }
                }
                attempt()
            },
            sleep,
        )
    }

    pub(crate) fn run_with_sleep<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> anyhow::Result<T>,
        mut sleep: impl FnMut(Duration),
    ) -> anyhow::Result<T> {
        let mut retry = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if error::is_transient(&e) && retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    tracing::warn!(
                        operation = what,
                        attempt = retry + 1,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "transient failure, backing off"
                    );
                    sleep(delay);
                    retry += 1;
                }
                Err(e) if error::is_transient(&e) => {
                    return Err(ExitError::Transient(format!(
                        "{what} failed after {} attempts: {e}",
                        retry + 1
                    ))
                    .into());
                }
                Err(e) => return Err(e),
            }
        }
    }
}
