//! Bounded retry loop with exponential backoff, jitter and cancellation.
//!
//! Every network call in the crate goes through [`RetryEngine::execute`].
//! The engine never swallows a terminal error: it only delays and repeats
//! failures the policy classifies as transient.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use metrics::{counter, gauge};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::capabilities::DEFAULT_RETRYABLE_STATUS_CODES;

/// Jitter widens a computed delay by up to this fraction either way.
pub const JITTER_FRACTION: f64 = 0.25;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionFailure {
    Timeout,
    Dns,
    Reset,
    NoNetwork,
    Tls,
}

/// How a failed attempt should be classified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Connection(ConnectionFailure),
    Status(u16),
    /// Malformed request or anything else that will not improve on retry.
    Terminal,
}

/// Errors that can be classified for retry.
pub trait Retryable {
    fn failure_kind(&self) -> FailureKind;
}

pub type RetryPredicate = Arc<dyn Fn(&FailureKind) -> bool + Send + Sync>;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
    pub retryable_status_codes: Vec<u16>,
    pub retry_connection_errors: bool,
    #[serde(skip)]
    predicate: Option<RetryPredicate>,
}

impl RetryPolicy {
    /// 3 attempts, 1s base, 30s cap, x2.
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
            retry_connection_errors: true,
            predicate: None,
        }
    }

    pub fn fast() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            ..Self::standard()
        }
    }

    pub fn persistent() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            ..Self::standard()
        }
    }

    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            use_jitter: false,
            ..Self::standard()
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::standard()),
            "fast" => Some(Self::fast()),
            "persistent" => Some(Self::persistent()),
            "none" => Some(Self::none()),
            _ => None,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Replace the built-in classification.
    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&FailureKind) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn should_retry(&self, kind: &FailureKind) -> bool {
        if let Some(predicate) = &self.predicate {
            return predicate(kind);
        }
        match kind {
            FailureKind::Connection(_) => self.retry_connection_errors,
            FailureKind::Status(code) => self.retryable_status_codes.contains(code),
            FailureKind::Terminal => false,
        }
    }

    /// Backoff before the retry that follows failed attempt `attempt` (1-based),
    /// without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Applies `factor` (expected in `[-JITTER_FRACTION, JITTER_FRACTION]`) and
    /// clamps the result into `[0, max_delay]`.
    pub fn apply_jitter(&self, delay: Duration, factor: f64) -> Duration {
        let millis = delay.as_millis() as f64;
        let widened = millis + millis * factor;
        let clamped = widened.clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(clamped as u64)
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.use_jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        self.apply_jitter(delay, factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("use_jitter", &self.use_jitter)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("retry_connection_errors", &self.retry_connection_errors)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Snapshot handed to observers before each backoff sleep.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub computed_delay: Duration,
    pub last_error: String,
}

pub trait RetryObserver: Send + Sync {
    fn on_retry(&self, _state: &RetryState) {}

    fn on_success(&self, _attempts: u32) {}

    fn on_failure(&self, _attempts: u32, _error: &str) {}
}

#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("operation failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Cancelled { attempts } | RetryError::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Failed { source, .. } => Some(source),
            RetryError::Cancelled { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RetryMetrics {
    pub attempts: AtomicU64,
    pub retries: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub cancellations: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryMetricsSnapshot {
    pub attempts: u64,
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub in_flight: usize,
}

/// Decrements the in-flight gauge however `execute` exits, including drop.
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("retry.in_flight").set(now as f64);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let now = self.counter.fetch_sub(1, Ordering::SeqCst) - 1;
        gauge!("retry.in_flight").set(now as f64);
    }
}

#[derive(Clone, Default)]
pub struct RetryEngine {
    in_flight: Arc<AtomicUsize>,
    metrics: Arc<RetryMetrics>,
    observer: Option<Arc<dyn RetryObserver>>,
}

impl RetryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Operations currently inside [`execute`](Self::execute).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> RetryMetricsSnapshot {
        RetryMetricsSnapshot {
            attempts: self.metrics.attempts.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            cancellations: self.metrics.cancellations.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }

    #[instrument(skip_all, fields(max_attempts = policy.max_attempts))]
    pub async fn execute<T, E, F, Fut>(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let _guard = InFlightGuard::enter(&self.in_flight);
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled(attempt));
            }

            attempt += 1;
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);
            counter!("retry.attempts").increment(1);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(attempt)),
                outcome = operation() => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                    counter!("retry.successes").increment(1);
                    if let Some(observer) = &self.observer {
                        observer.on_success(attempt);
                    }
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = error.failure_kind();
            if !policy.should_retry(&kind) || attempt >= max_attempts {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                counter!("retry.failures").increment(1);
                warn!(attempt, ?kind, error = %error, "operation failed, not retrying");
                if let Some(observer) = &self.observer {
                    observer.on_failure(attempt, &error.to_string());
                }
                return Err(RetryError::Failed {
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = policy.next_delay(attempt);
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            counter!("retry.retries").increment(1);
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "scheduling retry");

            if let Some(observer) = &self.observer {
                observer.on_retry(&RetryState {
                    attempt,
                    max_attempts,
                    computed_delay: delay,
                    last_error: error.to_string(),
                });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled(attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Single-item stream over [`execute`](Self::execute) for stream-driven callers.
    pub fn execute_stream<'a, T, E, F, Fut>(
        &'a self,
        policy: &'a RetryPolicy,
        cancel: &'a CancellationToken,
        operation: F,
    ) -> impl Stream<Item = Result<T, RetryError<E>>> + 'a
    where
        T: 'a,
        F: FnMut() -> Fut + 'a,
        Fut: Future<Output = Result<T, E>> + 'a,
        E: Retryable + fmt::Display + 'a,
    {
        stream::once(self.execute(policy, cancel, operation))
    }

    fn cancelled<E>(&self, attempts: u32) -> RetryError<E> {
        self.metrics.cancellations.fetch_add(1, Ordering::Relaxed);
        counter!("retry.cancellations").increment(1);
        debug!(attempts, "retry loop cancelled");
        RetryError::Cancelled { attempts }
    }
}

impl fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("in_flight", &self.in_flight())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
