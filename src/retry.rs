//! Retry executor — runs fallible async operations with exponential backoff.
//!
//! Every call to a remote service (aborted checks, image pulls, state and
//! result reporting) goes through a [`Retryer`]. Errors are classified with
//! [`Classify`]: a [`ErrorKind::Permanent`] error stops retrying at once, a
//! transient one is retried until the retry ceiling or the backoff policy is
//! exhausted, or until the caller's cancellation token fires.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Default jitter applied to every backoff delay.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.05;

/// Upper bound for a single backoff delay.
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(300);

/// Whether retrying an operation that failed with an error can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or service hiccup, eligible for retry.
    Transient,
    /// Retrying cannot succeed (bad protocol response, malformed payload).
    Permanent,
}

/// Classification of an error for retry purposes.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Permanent
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub interval: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it (0.0-1.0).
    pub jitter_factor: f64,
    /// Cap for a single delay.
    pub max_interval: Duration,
    /// Maximum number of delays the policy hands out.
    pub max_retries: u32,
    /// Optional deadline measured from the first attempt.
    pub max_elapsed: Option<Duration>,
}

impl BackoffPolicy {
    /// Exponential policy doubling `interval` on each retry.
    pub fn exponential(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            multiplier: 2.0,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_retries,
            max_elapsed: None,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Start a fresh cursor over this schedule.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            handed_out: 0,
            started: Instant::now(),
        }
    }
}

/// Per-call cursor over a [`BackoffPolicy`].
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    handed_out: u32,
    started: Instant,
}

impl Backoff {
    /// Delay before the next attempt, or `None` once the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.handed_out >= self.policy.max_retries {
            return None;
        }
        if let Some(max_elapsed) = self.policy.max_elapsed
            && self.started.elapsed() >= max_elapsed
        {
            return None;
        }

        let exp = self.policy.multiplier.powi(self.handed_out as i32);
        let base = self.policy.interval.as_secs_f64() * exp;
        let capped = base.min(self.policy.max_interval.as_secs_f64());
        self.handed_out += 1;

        Some(jitter(
            Duration::from_secs_f64(capped),
            self.policy.jitter_factor,
        ))
    }
}

fn jitter(delay: Duration, factor: f64) -> Duration {
    let spread = delay.as_secs_f64() * factor;
    if spread <= 0.0 {
        return delay;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
}

/// Executes operations with retries and exponential backoff.
///
/// Holds no per-call state, so one value can be cloned and shared freely.
#[derive(Debug, Clone)]
pub struct Retryer {
    policy: BackoffPolicy,
    retries: u32,
}

impl Retryer {
    /// Retryer with an exponential policy starting at `interval`.
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self::with_policy(BackoffPolicy::exponential(interval, retries), retries)
    }

    pub fn with_policy(policy: BackoffPolicy, retries: u32) -> Self {
        Self { policy, retries }
    }

    /// Retry ceiling: at most `retries + 1` invocations per call.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Run `exec` until it succeeds, fails permanently or retries run out.
    pub async fn with_retries<T, E, F, Fut>(&self, op: &str, exec: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.execute(op, None, exec).await
    }

    /// Like [`Retryer::with_retries`] but gives up when `cancel` fires
    /// during a backoff wait, returning the last error.
    pub async fn with_retries_until<T, E, F, Fut>(
        &self,
        op: &str,
        cancel: &CancellationToken,
        exec: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.execute(op, Some(cancel), exec).await
    }

    async fn execute<T, E, F, Fut>(
        &self,
        op: &str,
        cancel: Option<&CancellationToken>,
        mut exec: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let mut backoff = self.policy.start();
        // The first call is not a retry.
        let mut retries = 0u32;

        loop {
            let err = match exec().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if err.is_permanent() {
                error!(operation = op, error = %err, "Permanent error returned, backoff finished");
                return Err(err);
            }
            if retries == self.retries {
                error!(
                    operation = op,
                    retry = retries,
                    error = %err,
                    "Backoff finished, unable to finish operation"
                );
                return Err(err);
            }
            let Some(delay) = backoff.next_delay() else {
                error!(
                    operation = op,
                    retry = retries,
                    error = %err,
                    "Backoff policy exhausted, unable to finish operation"
                );
                return Err(err);
            };

            match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            warn!(operation = op, retry = retries, error = %err, "Retries cancelled");
                            return Err(err);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }

            retries += 1;
            warn!(operation = op, retry = retries, error = %err, "Retrying operation");
        }
    }
}
