//! Retry executor shared by the source and vault adapters.
//!
//! The executor only knows about control flow: the caller supplies a
//! classifier deciding whether an error is worth another attempt.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the second attempt; doubled for every further one.
    pub base: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Wall-clock budget across all attempts and delays.
    pub max_elapsed: Duration,
    /// Random extra delay added to every wait, between zero and this value.
    pub jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            max_attempts: 10,
            max_elapsed: Duration::from_secs(30),
            jitter: Duration::from_millis(20),
        }
    }
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        capped + Duration::from_millis(jitter)
    }
}

/// Verdict of a classifier on a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Classified<E> {
    Retriable(E),
    Terminal(E),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("{0}")]
    Terminal(E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("operation cancelled")]
    Cancelled,
}

/// Run `op` until it succeeds, `classify` calls an error terminal, the
/// backoff budget runs out or `cancel` fires.
///
/// Cancellation is checked before every attempt and interrupts the wait
/// between attempts; an attempt already in flight is allowed to finish.
pub async fn retry<T, E, F, Fut, C>(
    backoff: &Backoff,
    cancel: &CancellationToken,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(E) -> Classified<E>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match classify(e) {
                Classified::Terminal(e) => {
                    debug!(attempt, error = %e, "terminal error, not retrying");
                    return Err(RetryError::Terminal(e));
                }
                Classified::Retriable(e) => e,
            },
        };

        let elapsed = started.elapsed();
        if attempt >= backoff.max_attempts || elapsed >= backoff.max_elapsed {
            debug!(
                attempt,
                elapsed = ?elapsed,
                error = %err,
                "retry budget exhausted"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let wait = backoff.delay(attempt).min(backoff.max_elapsed - elapsed);
        warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}...",
            attempt, backoff.max_attempts, err, wait
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = sleep(wait) => {}
        }
    }
}
