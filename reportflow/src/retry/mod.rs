//! Retry controller for outbound calls and report polling.
//!
//! A call is attempted, its outcome is classified, and [`RetryPolicy::should_retry`]
//! decides whether to go again. "Not ready yet" is a first-class outcome
//! ([`Readiness::InProgress`]) rather than an error, so polling loops and
//! transport retries share one controller.

mod backoff;

pub use backoff::{backoff_delay, BackoffKind, JitterStrategy};

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::errors::{ReportflowError, Result};
use crate::events::{event_types, noop_sink, EventSink};
use crate::http::HttpError;

fn default_max_attempts() -> u32 {
    21
}

fn default_max_no_response_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_retryable_statuses() -> Vec<(u16, u16)> {
    vec![(100, 199), (429, 429), (500, 599)]
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts allowed, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Total attempts allowed when the last failure received no response.
    #[serde(default = "default_max_no_response_attempts")]
    pub max_no_response_attempts: u32,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter applied to exponential delays.
    #[serde(default)]
    pub jitter: JitterStrategy,
    /// Inclusive status ranges that are worth retrying.
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<(u16, u16)>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_no_response_attempts: default_max_no_response_attempts(),
            backoff: BackoffKind::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: JitterStrategy::default(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

impl RetryConfig {
    /// Sets the attempt cap.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the no-response attempt cap.
    #[must_use]
    pub fn with_max_no_response_attempts(mut self, max: u32) -> Self {
        self.max_no_response_attempts = max;
        self
    }

    /// Sets the backoff strategy and base delay.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffKind, base_delay_ms: u64) -> Self {
        self.backoff = backoff;
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ReportflowError::configuration(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self
            .retryable_statuses
            .iter()
            .any(|(start, end)| start > end)
        {
            return Err(ReportflowError::configuration(
                "retry.retryable_statuses ranges must be [start, end] with start <= end",
            ));
        }
        Ok(())
    }
}

/// Outcome of a call that may not be ready yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness<T> {
    /// The call succeeded with a final value.
    Ready(T),
    /// The remote work is still running.
    InProgress,
}

/// How a failed attempt is treated by the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// No server response was received.
    NoResponse,
    /// The server answered with this status.
    Status(u16),
    /// Not worth retrying regardless of attempts left.
    Terminal,
}

/// Classifies an error for the retry decision.
pub trait Classify {
    /// Returns the failure class of this error.
    fn failure_class(&self) -> FailureClass;
}

impl Classify for HttpError {
    fn failure_class(&self) -> FailureClass {
        match self.status() {
            Some(status) => FailureClass::Status(status),
            None => FailureClass::NoResponse,
        }
    }
}

impl Classify for ReportflowError {
    fn failure_class(&self) -> FailureClass {
        match self {
            Self::Http(err) => err.failure_class(),
            _ => FailureClass::Terminal,
        }
    }
}

/// What the last attempt produced, as seen by [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The remote work is still running.
    InProgress,
    /// The attempt failed.
    Failed(FailureClass),
}

/// Per-chain retry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    /// Identifies every attempt of one logical call in logs and errors.
    pub correlation_id: Uuid,
    /// What is being called.
    pub label: String,
    /// Attempts started so far.
    pub attempt_count: u32,
    /// The outcome of the most recent attempt, once one has failed.
    pub last_outcome: Option<AttemptOutcome>,
}

impl RetryContext {
    /// Starts a new chain.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            label: label.into(),
            attempt_count: 0,
            last_outcome: None,
        }
    }
}

/// The final value of a retry chain together with its context.
#[derive(Debug)]
pub struct Attempted<T> {
    /// `Ready` on success, `InProgress` when the cap was hit while still running.
    pub outcome: Readiness<T>,
    /// The chain's context.
    pub context: RetryContext,
}

/// Decides whether and when to retry, and drives retry chains.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Creates a policy that reports to no event sink.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            events: noop_sink(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns true if a status falls in one of the retryable ranges.
    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.config
            .retryable_statuses
            .iter()
            .any(|(start, end)| (*start..=*end).contains(&status))
    }

    /// Decides whether the chain should make another attempt.
    ///
    /// In order: in-progress outcomes retry until the attempt cap; the
    /// attempt cap stops everything; no-response failures stop at their own
    /// cap; otherwise the failure must be retryable.
    #[must_use]
    pub fn should_retry(&self, ctx: &RetryContext, outcome: AttemptOutcome) -> bool {
        let attempts = ctx.attempt_count;
        let max_attempts = self.config.max_attempts;

        let class = match outcome {
            AttemptOutcome::InProgress => {
                if attempts >= max_attempts {
                    warn!(
                        correlation_id = %ctx.correlation_id,
                        label = %ctx.label,
                        attempts,
                        "Maximum attempts reached while still in progress"
                    );
                    return false;
                }
                debug!(
                    correlation_id = %ctx.correlation_id,
                    label = %ctx.label,
                    attempt = attempts,
                    "Not ready yet, retrying"
                );
                return true;
            }
            AttemptOutcome::Failed(class) => class,
        };

        if attempts >= max_attempts {
            warn!(
                correlation_id = %ctx.correlation_id,
                label = %ctx.label,
                attempts,
                "Maximum attempts reached"
            );
            return false;
        }

        if class == FailureClass::NoResponse && attempts >= self.config.max_no_response_attempts {
            warn!(
                correlation_id = %ctx.correlation_id,
                label = %ctx.label,
                attempts,
                "Maximum attempts without a response reached"
            );
            return false;
        }

        let retryable = match class {
            FailureClass::NoResponse => true,
            FailureClass::Status(status) => self.is_retryable_status(status),
            FailureClass::Terminal => false,
        };
        if !retryable {
            error!(
                correlation_id = %ctx.correlation_id,
                label = %ctx.label,
                failure = ?class,
                "Non-retryable failure"
            );
        }
        retryable
    }

    /// Returns the delay before the retry following attempt number `attempt`.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.config.backoff,
            self.config.jitter,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
            attempt,
        )
    }

    /// Drives `op` until it is ready, fails terminally, or a cap is hit.
    ///
    /// A terminal failure is returned as [`ReportflowError::Call`] carrying
    /// the chain's correlation id and attempt count. Hitting the cap while
    /// the work is still in progress is not an error here; the caller gets
    /// [`Readiness::InProgress`] and decides what it means.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<Attempted<T>>
    where
        F: FnMut(&RetryContext) -> Fut,
        Fut: Future<Output = Result<Readiness<T>>>,
    {
        let mut ctx = RetryContext::new(label);

        loop {
            ctx.attempt_count += 1;

            let (outcome, failure) = match op(&ctx).await {
                Ok(Readiness::Ready(value)) => {
                    if ctx.attempt_count > 1 {
                        debug!(
                            correlation_id = %ctx.correlation_id,
                            label = %ctx.label,
                            attempts = ctx.attempt_count,
                            "Succeeded after retry"
                        );
                    }
                    return Ok(Attempted {
                        outcome: Readiness::Ready(value),
                        context: ctx,
                    });
                }
                Ok(Readiness::InProgress) => (AttemptOutcome::InProgress, None),
                Err(err) => (AttemptOutcome::Failed(err.failure_class()), Some(err)),
            };
            ctx.last_outcome = Some(outcome);

            if !self.should_retry(&ctx, outcome) {
                self.events.try_emit(
                    event_types::RETRY_EXHAUSTED,
                    Some(serde_json::json!({
                        "label": ctx.label,
                        "correlation_id": ctx.correlation_id.to_string(),
                        "attempts": ctx.attempt_count,
                        "in_progress": failure.is_none(),
                    })),
                );
                return match failure {
                    None => Ok(Attempted {
                        outcome: Readiness::InProgress,
                        context: ctx,
                    }),
                    Some(err) => Err(ReportflowError::Call {
                        label: ctx.label,
                        correlation_id: ctx.correlation_id,
                        attempts: ctx.attempt_count,
                        source: Box::new(err),
                    }),
                };
            }

            let delay = self.next_delay(ctx.attempt_count);
            match &failure {
                Some(err) => warn!(
                    correlation_id = %ctx.correlation_id,
                    label = %ctx.label,
                    attempt = ctx.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                ),
                None => debug!(
                    correlation_id = %ctx.correlation_id,
                    label = %ctx.label,
                    attempt = ctx.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    "Polling again"
                ),
            }
            self.events.try_emit(
                event_types::RETRY_ATTEMPT,
                Some(serde_json::json!({
                    "label": ctx.label,
                    "correlation_id": ctx.correlation_id.to_string(),
                    "attempt": ctx.attempt_count,
                    "delay_ms": delay.as_millis() as u64,
                    "error": failure.as_ref().map(ToString::to_string),
                })),
            );

            tokio::time::sleep(delay).await;
        }
    }

    /// Drives a call that is ready as soon as it succeeds.
    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&RetryContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempted = self
            .run(label, |ctx| {
                let fut = op(ctx);
                async move { fut.await.map(Readiness::Ready) }
            })
            .await?;

        match attempted.outcome {
            Readiness::Ready(value) => Ok(value),
            Readiness::InProgress => Err(ReportflowError::Internal(format!(
                "{label} reported in progress without a polling contract"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::http::{HttpMethod, HttpRequest, NoResponseKind};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig::default()
            .with_backoff(BackoffKind::Static, 1)
            .with_jitter(JitterStrategy::None)
    }

    fn status_error(status: u16) -> ReportflowError {
        let request = HttpRequest::new(HttpMethod::Get, "https://api.example.com/r/1");
        HttpError::status_error(&request, status, serde_json::Value::Null).into()
    }

    fn no_response_error() -> ReportflowError {
        let request = HttpRequest::new(HttpMethod::Get, "https://api.example.com/r/1");
        HttpError::no_response(&request, NoResponseKind::Connect, "refused").into()
    }

    fn ctx_at(attempts: u32) -> RetryContext {
        let mut ctx = RetryContext::new("test");
        ctx.attempt_count = attempts;
        ctx
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 21);
        assert_eq!(config.max_no_response_attempts, 3);
        assert_eq!(config.backoff, BackoffKind::Exponential);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_attempts": 5, "backoff": "linear"}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff, BackoffKind::Linear);
        assert_eq!(config.retryable_statuses, default_retryable_statuses());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = RetryConfig::default().with_max_attempts(0);
        assert!(matches!(
            config.validate(),
            Err(ReportflowError::Configuration(_))
        ));
    }

    #[test]
    fn test_retryable_statuses() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable_status(102));
        assert!(policy.is_retryable_status(429));
        assert!(policy.is_retryable_status(503));
        assert!(!policy.is_retryable_status(400));
        assert!(!policy.is_retryable_status(404));
    }

    #[test]
    fn test_classify() {
        assert_eq!(status_error(503).failure_class(), FailureClass::Status(503));
        assert_eq!(no_response_error().failure_class(), FailureClass::NoResponse);
        assert_eq!(
            ReportflowError::MalformedResponse("x".into()).failure_class(),
            FailureClass::Terminal
        );
    }

    #[test]
    fn test_should_retry_order() {
        let policy = RetryPolicy::new(fast_config().with_max_attempts(5));

        // In progress retries until the overall cap.
        assert!(policy.should_retry(&ctx_at(4), AttemptOutcome::InProgress));
        assert!(!policy.should_retry(&ctx_at(5), AttemptOutcome::InProgress));

        // No-response failures stop at their own cap.
        let no_response = AttemptOutcome::Failed(FailureClass::NoResponse);
        assert!(policy.should_retry(&ctx_at(2), no_response));
        assert!(!policy.should_retry(&ctx_at(3), no_response));

        // The no-response cap does not apply to status failures.
        let busy = AttemptOutcome::Failed(FailureClass::Status(503));
        assert!(policy.should_retry(&ctx_at(3), busy));
        assert!(!policy.should_retry(&ctx_at(5), busy));

        let not_found = AttemptOutcome::Failed(FailureClass::Status(404));
        assert!(!policy.should_retry(&ctx_at(1), not_found));
        assert!(!policy.should_retry(&ctx_at(1), AttemptOutcome::Failed(FailureClass::Terminal)));
    }

    #[test]
    fn test_next_delay_follows_config() {
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_backoff(BackoffKind::Linear, 100)
                .with_jitter(JitterStrategy::None),
        );
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_cap_of_three_attempts_surfaces_final_error() {
        let events = Arc::new(CollectingEventSink::new());
        let policy =
            RetryPolicy::new(fast_config().with_max_attempts(3)).with_event_sink(events.clone());
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .call("submit", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(status_error(500 + n as u16)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        match err.root() {
            ReportflowError::Http(http) => assert_eq!(http.status(), Some(503)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(events.events_of_type(event_types::RETRY_ATTEMPT).len(), 2);
        assert_eq!(events.events_of_type(event_types::RETRY_EXHAUSTED).len(), 1);
    }

    #[tokio::test]
    async fn test_no_response_cap() {
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .call("poll", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(no_response_error()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .call("submit", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(status_error(401)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().attempts(), Some(1));
    }

    #[tokio::test]
    async fn test_in_progress_then_ready() {
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);

        let attempted = policy
            .run("poll", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    let readiness = if n < 4 {
                        Readiness::InProgress
                    } else {
                        Readiness::Ready("done")
                    };
                    Ok::<_, ReportflowError>(readiness)
                }
            })
            .await
            .unwrap();

        assert_eq!(attempted.outcome, Readiness::Ready("done"));
        assert_eq!(attempted.context.attempt_count, 4);
    }

    #[tokio::test]
    async fn test_in_progress_until_cap() {
        let policy = RetryPolicy::new(fast_config().with_max_attempts(4));

        let attempted = policy
            .run("poll", |_| async { Ok::<_, ReportflowError>(Readiness::<()>::InProgress) })
            .await
            .unwrap();

        assert_eq!(attempted.outcome, Readiness::InProgress);
        assert_eq!(attempted.context.attempt_count, 4);
        assert_eq!(attempted.context.last_outcome, Some(AttemptOutcome::InProgress));
    }

    #[tokio::test]
    async fn test_correlation_id_is_stable_across_attempts() {
        let policy = RetryPolicy::new(fast_config().with_max_attempts(3));
        let seen = Mutex::new(Vec::new());

        let _: Result<()> = policy
            .call("submit", |ctx| {
                seen.lock().push((ctx.correlation_id, ctx.attempt_count));
                async { Err(status_error(500)) }
            })
            .await;

        let seen = seen.into_inner();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(id, _)| *id == seen[0].0));
        assert_eq!(
            seen.iter().map(|(_, n)| *n).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }
}
