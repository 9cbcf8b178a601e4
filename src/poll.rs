use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};

const MAX_OBSERVED_CHARS: usize = 4096;

/// How long, and how often, to re-check an eventually-consistent observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    timeout: Duration,
    interval: Duration,
}

impl PollPolicy {
    #[must_use]
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Re-runs `produce` until a value satisfies `satisfies` or the policy times out.
///
/// Errors from `produce` count as "not yet satisfied". A single attempt is
/// abandoned once it runs past the deadline by more than one interval, so the
/// call never blocks longer than `timeout + interval`.
///
/// # Errors
/// Returns [`HarnessError::Timeout`] carrying the last observed value or error.
pub async fn eventually<T, E, F, Fut, P>(
    policy: &PollPolicy,
    what: &str,
    mut produce: F,
    mut satisfies: P,
) -> Result<T>
where
    T: Debug,
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let hard_deadline = deadline + policy.interval;
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        let last_observed = match tokio::time::timeout_at(hard_deadline, produce()).await {
            Ok(Ok(value)) => {
                if satisfies(&value) {
                    debug!("{what}: satisfied after {attempt} attempt(s)");
                    return Ok(value);
                }
                truncate(format!("{value:?}"))
            }
            Ok(Err(err)) => {
                debug!("{what}: attempt {attempt} failed: {err}");
                truncate(format!("error: {err}"))
            }
            Err(_) => "attempt did not complete before the deadline".to_string(),
        };

        let now = Instant::now();
        if now >= deadline {
            warn!("{what}: not satisfied after {attempt} attempt(s)");
            return Err(HarnessError::Timeout {
                what: what.to_string(),
                waited: now - started,
                last_observed,
            });
        }
        tokio::time::sleep(policy.interval.min(deadline - now)).await;
    }
}

fn truncate(mut value: String) -> String {
    if let Some((index, _)) = value.char_indices().nth(MAX_OBSERVED_CHARS) {
        value.truncate(index);
        value.push_str("...");
    }
    value
}
