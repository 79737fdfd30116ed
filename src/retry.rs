//! Retry + fallback-chain execution with per-attempt deadlines
//!
//! [`RetryExecutor`] runs a primary operation with exponential backoff and,
//! once the primary is exhausted, each fallback exactly once in order. Every
//! attempt is bounded by the policy's timeout:
//!
//! - the synchronous path passes an explicit [`Deadline`] to the operation
//!   and discards any value produced after it expired;
//! - the asynchronous path wraps each attempt in `tokio::time::timeout`, so
//!   dropping the enclosing future drops the in-flight attempt as well.
//!
//! # Example
//!
//! ```rust,no_run
//! use evolver_core::retry::{AsyncRetryExecutor, RetryPolicy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::new(2, 100, 5_000)?;
//! let executor = AsyncRetryExecutor::new(policy, |x: u32| async move { Ok::<_, String>(x * 2) });
//! let outcome = executor.execute(21).await?;
//! assert_eq!(outcome.value, 42);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Boxed future returned by [`AsyncOperation`]
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Retry policy, validated on construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first primary attempt (total attempts = max_retries + 1)
    pub max_retries: u32,

    /// Base delay; the delay before retry k (0-indexed) is base * 2^k
    pub backoff_base_ms: u64,

    /// Upper bound for a single attempt
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
            timeout_ms: 600_000, // 10 minutes per evaluator batch
        }
    }
}

/// Rejected retry policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("backoff_base_ms must be greater than 0")]
    ZeroBackoff,

    #[error("timeout_ms must be greater than 0")]
    ZeroTimeout,
}

impl RetryPolicy {
    /// Build a validated policy
    pub fn new(max_retries: u32, backoff_base_ms: u64, timeout_ms: u64) -> Result<Self, PolicyError> {
        let policy = Self {
            max_retries,
            backoff_base_ms,
            timeout_ms,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Check the invariants of a policy built from deserialized data
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.backoff_base_ms == 0 {
            return Err(PolicyError::ZeroBackoff);
        }
        if self.timeout_ms == 0 {
            return Err(PolicyError::ZeroTimeout);
        }
        Ok(())
    }

    /// Delay before retry `k` (0-indexed)
    pub fn backoff(&self, k: u32) -> Duration {
        let factor = 2u64.saturating_pow(k);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Point in time after which an attempt's result is discarded
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Which operation produced an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "index")]
pub enum AttemptSource {
    Primary,
    /// Index into the fallback list
    Fallback(usize),
}

impl fmt::Display for AttemptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptSource::Primary => write!(f, "primary"),
            AttemptSource::Fallback(i) => write!(f, "fallback[{}]", i),
        }
    }
}

/// Outcome of a single attempt, as recorded for observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub source: AttemptSource,
    /// 0-indexed attempt number within the whole call
    pub attempt: usize,
    pub status: AttemptStatus,
    pub elapsed_ms: u64,
}

/// Observability summary of one `execute` call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryReport {
    pub attempts: Vec<AttemptRecord>,
    pub success_source: Option<AttemptSource>,
    pub total_elapsed_ms: u64,
}

impl RetryReport {
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Number of attempts made against fallbacks
    pub fn fallback_invocations(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| matches!(a.source, AttemptSource::Fallback(_)))
            .count()
    }

    fn push(&mut self, source: AttemptSource, status: AttemptStatus, elapsed: Duration) {
        let attempt = self.attempts.len();
        debug!(%source, attempt, ?status, "retry attempt finished");
        self.attempts.push(AttemptRecord {
            source,
            attempt,
            status,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }
}

/// Why one attempt failed
#[derive(Debug)]
pub enum AttemptFailure<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Failed(e) => write!(f, "{}", e),
            AttemptFailure::TimedOut(d) => write!(f, "timed out after {:?}", d),
        }
    }
}

/// Every underlying error of an exhausted call, in attempt order
#[derive(Error, Debug)]
#[error("all {} attempts failed: {}", .errors.len(), summarize(.errors))]
pub struct RetryError<E: fmt::Debug + fmt::Display> {
    pub errors: Vec<(AttemptSource, AttemptFailure<E>)>,
    pub report: RetryReport,
}

fn summarize<E: fmt::Display>(errors: &[(AttemptSource, AttemptFailure<E>)]) -> String {
    errors
        .iter()
        .map(|(source, failure)| format!("{}: {}", source, failure))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Successful call: the value plus how it was obtained
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub report: RetryReport,
}

/// Blocking operation; must honour the deadline it is handed
pub trait Operation<I, O, E>: Send + Sync {
    fn call(&self, input: &I, deadline: Deadline) -> Result<O, E>;
}

impl<I, O, E, F> Operation<I, O, E> for F
where
    F: Fn(&I, Deadline) -> Result<O, E> + Send + Sync,
{
    fn call(&self, input: &I, deadline: Deadline) -> Result<O, E> {
        self(input, deadline)
    }
}

/// Synchronous retry executor
pub struct RetryExecutor<I, O, E> {
    policy: RetryPolicy,
    primary: Arc<dyn Operation<I, O, E>>,
    fallbacks: Vec<Arc<dyn Operation<I, O, E>>>,
}

impl<I, O, E> RetryExecutor<I, O, E>
where
    E: fmt::Debug + fmt::Display,
{
    pub fn new(policy: RetryPolicy, primary: impl Operation<I, O, E> + 'static) -> Self {
        Self {
            policy,
            primary: Arc::new(primary),
            fallbacks: Vec::new(),
        }
    }

    /// Append a fallback; fallbacks run once each, in insertion order
    pub fn with_fallback(mut self, fallback: impl Operation<I, O, E> + 'static) -> Self {
        self.fallbacks.push(Arc::new(fallback));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn execute(&self, input: &I) -> Result<RetryOutcome<O>, RetryError<E>> {
        let started = Instant::now();
        let mut report = RetryReport::default();
        let mut errors = Vec::new();

        for k in 0..=self.policy.max_retries {
            if k > 0 {
                std::thread::sleep(self.policy.backoff(k - 1));
            }
            match self.attempt(self.primary.as_ref(), input, AttemptSource::Primary, &mut report) {
                Ok(value) => return Ok(finish(value, AttemptSource::Primary, report, started)),
                Err(failure) => errors.push((AttemptSource::Primary, failure)),
            }
        }

        for (i, fallback) in self.fallbacks.iter().enumerate() {
            let source = AttemptSource::Fallback(i);
            match self.attempt(fallback.as_ref(), input, source, &mut report) {
                Ok(value) => return Ok(finish(value, source, report, started)),
                Err(failure) => errors.push((source, failure)),
            }
        }

        Err(exhausted(errors, report, started))
    }

    fn attempt(
        &self,
        op: &dyn Operation<I, O, E>,
        input: &I,
        source: AttemptSource,
        report: &mut RetryReport,
    ) -> Result<O, AttemptFailure<E>> {
        let budget = self.policy.timeout();
        let deadline = Deadline::after(budget);
        let attempt_started = Instant::now();
        let result = op.call(input, deadline);
        let elapsed = attempt_started.elapsed();

        if deadline.is_expired() {
            report.push(source, AttemptStatus::TimedOut, elapsed);
            return Err(AttemptFailure::TimedOut(budget));
        }
        match result {
            Ok(value) => {
                report.push(source, AttemptStatus::Succeeded, elapsed);
                Ok(value)
            }
            Err(e) => {
                report.push(source, AttemptStatus::Failed(e.to_string()), elapsed);
                Err(AttemptFailure::Failed(e))
            }
        }
    }
}

/// Cancellable operation returning a boxed future
pub trait AsyncOperation<I, O, E>: Send + Sync {
    fn call(&self, input: I) -> BoxFuture<'static, Result<O, E>>;
}

impl<I, O, E, F, Fut> AsyncOperation<I, O, E> for F
where
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
{
    fn call(&self, input: I) -> BoxFuture<'static, Result<O, E>> {
        Box::pin(self(input))
    }
}

/// Asynchronous retry executor; suspends only at backoff sleeps and attempts
pub struct AsyncRetryExecutor<I, O, E> {
    policy: RetryPolicy,
    primary: Arc<dyn AsyncOperation<I, O, E>>,
    fallbacks: Vec<Arc<dyn AsyncOperation<I, O, E>>>,
}

impl<I, O, E> AsyncRetryExecutor<I, O, E>
where
    I: Clone + Send,
    E: fmt::Debug + fmt::Display,
{
    pub fn new(policy: RetryPolicy, primary: impl AsyncOperation<I, O, E> + 'static) -> Self {
        Self {
            policy,
            primary: Arc::new(primary),
            fallbacks: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: impl AsyncOperation<I, O, E> + 'static) -> Self {
        self.fallbacks.push(Arc::new(fallback));
        self
    }

    /// Same as [`with_fallback`](Self::with_fallback) for already shared operations
    pub fn with_shared_fallback(mut self, fallback: Arc<dyn AsyncOperation<I, O, E>>) -> Self {
        self.fallbacks.push(fallback);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute(&self, input: I) -> Result<RetryOutcome<O>, RetryError<E>> {
        let started = Instant::now();
        let mut report = RetryReport::default();
        let mut errors = Vec::new();

        for k in 0..=self.policy.max_retries {
            if k > 0 {
                tokio::time::sleep(self.policy.backoff(k - 1)).await;
            }
            let source = AttemptSource::Primary;
            match self.attempt(self.primary.as_ref(), input.clone(), source, &mut report).await {
                Ok(value) => return Ok(finish(value, source, report, started)),
                Err(failure) => errors.push((source, failure)),
            }
        }

        for (i, fallback) in self.fallbacks.iter().enumerate() {
            let source = AttemptSource::Fallback(i);
            match self.attempt(fallback.as_ref(), input.clone(), source, &mut report).await {
                Ok(value) => return Ok(finish(value, source, report, started)),
                Err(failure) => errors.push((source, failure)),
            }
        }

        Err(exhausted(errors, report, started))
    }

    async fn attempt(
        &self,
        op: &dyn AsyncOperation<I, O, E>,
        input: I,
        source: AttemptSource,
        report: &mut RetryReport,
    ) -> Result<O, AttemptFailure<E>> {
        let budget = self.policy.timeout();
        let attempt_started = Instant::now();
        match tokio::time::timeout(budget, op.call(input)).await {
            Ok(Ok(value)) => {
                report.push(source, AttemptStatus::Succeeded, attempt_started.elapsed());
                Ok(value)
            }
            Ok(Err(e)) => {
                report.push(
                    source,
                    AttemptStatus::Failed(e.to_string()),
                    attempt_started.elapsed(),
                );
                Err(AttemptFailure::Failed(e))
            }
            Err(_) => {
                report.push(source, AttemptStatus::TimedOut, attempt_started.elapsed());
                Err(AttemptFailure::TimedOut(budget))
            }
        }
    }
}

fn finish<T>(value: T, source: AttemptSource, mut report: RetryReport, started: Instant) -> RetryOutcome<T> {
    report.success_source = Some(source);
    report.total_elapsed_ms = started.elapsed().as_millis() as u64;
    if matches!(source, AttemptSource::Fallback(_)) {
        info!(
            %source,
            attempts = report.attempt_count(),
            elapsed_ms = report.total_elapsed_ms,
            "primary exhausted, fallback succeeded"
        );
    } else {
        debug!(
            attempts = report.attempt_count(),
            elapsed_ms = report.total_elapsed_ms,
            "primary succeeded"
        );
    }
    RetryOutcome { value, report }
}

fn exhausted<E: fmt::Debug + fmt::Display>(
    errors: Vec<(AttemptSource, AttemptFailure<E>)>,
    mut report: RetryReport,
    started: Instant,
) -> RetryError<E> {
    report.total_elapsed_ms = started.elapsed().as_millis() as u64;
    warn!(
        attempts = report.attempt_count(),
        elapsed_ms = report.total_elapsed_ms,
        "all retry attempts and fallbacks failed"
    );
    RetryError { errors, report }
}
