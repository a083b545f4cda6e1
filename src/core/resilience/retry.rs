use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

/// Exponential backoff with downward jitter.
///
/// Attempts are 1-based: the delay slept after attempt `n` fails is
/// `min(base_delay * backoff_factor^(n-1), max_delay)`, then scaled by a
/// uniform factor in `[1 - jitter_fraction, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
        jitter_fraction: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff_factor,
            max_delay,
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
        }
    }

    /// Capped exponential delay for `attempt` before jitter is applied.
    pub fn delay_before_jitter(&self, attempt: u32) -> Duration {
        // 2^30 already dwarfs any sane max_delay
        const MAX_EXP: i32 = 30;
        let exp = i32::try_from(attempt.saturating_sub(1)).map_or(MAX_EXP, |e| e.min(MAX_EXP));
        let base = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = base.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    pub fn apply_jitter(&self, delay: Duration) -> Duration {
        let jitter = self.jitter_fraction.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        delay.mul_f64(factor)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.delay_before_jitter(attempt))
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts. The last error is returned on exhaustion.
pub async fn retry_async<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    op: &str,
    is_retryable: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        debug!("Attempt {}/{} for {}", attempt, max_attempts, op);
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{} succeeded on attempt {}", op, attempt);
                }
                return Ok(value);
            }
            Err(e) if !is_retryable(&e) => {
                warn!("{} failed with non-retryable error: {}", op, e);
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                error!("{} failed after {} attempts: {}", op, max_attempts, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed on attempt {}, retrying in {:.2}s: {}",
                    op,
                    attempt,
                    delay.as_secs_f64(),
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Blocking twin of [`retry_async`] for synchronous call sites.
pub fn retry_blocking<T, E, F, P>(
    policy: &RetryPolicy,
    op: &str,
    is_retryable: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => {
                if attempt > 1 {
                    info!("{} succeeded on attempt {}", op, attempt);
                }
                return Ok(value);
            }
            Err(e) if !is_retryable(&e) => {
                warn!("{} failed with non-retryable error: {}", op, e);
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                error!("{} failed after {} attempts: {}", op, max_attempts, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed on attempt {}, retrying in {:.2}s: {}",
                    op,
                    attempt,
                    delay.as_secs_f64(),
                    e
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}
