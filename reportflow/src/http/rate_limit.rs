//! Process-wide rate limiter shared by every outbound call.

use async_trait::async_trait;
use governor::clock::MonotonicClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::middleware::NoOpMiddleware;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::{HttpClient, HttpError, HttpRequest, HttpResponse};
use crate::errors::{ReportflowError, Result};

fn default_max_requests() -> u32 {
    1
}

fn default_per_milliseconds() -> u64 {
    2000
}

/// Rate limit: at most `max_requests` calls per `per_milliseconds` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls allowed per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Window length in milliseconds.
    #[serde(default = "default_per_milliseconds")]
    pub per_milliseconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            per_milliseconds: default_per_milliseconds(),
        }
    }
}

impl RateLimitConfig {
    /// Creates a rate limit config.
    #[must_use]
    pub fn new(max_requests: u32, per_milliseconds: u64) -> Self {
        Self {
            max_requests,
            per_milliseconds,
        }
    }

    /// Checks that the limit is usable.
    pub fn validate(&self) -> Result<()> {
        self.quota().map(|_| ())
    }

    /// Calls are spaced one emission interval (`window / max_requests`,
    /// rounded up) apart with no burst, so no window of `per_milliseconds`
    /// ever holds more than `max_requests` calls.
    fn quota(&self) -> Result<Quota> {
        let max_requests = NonZeroU32::new(self.max_requests).ok_or_else(|| {
            ReportflowError::configuration("rate_limit.max_requests must be greater than 0")
        })?;
        let window_nanos = u128::from(self.per_milliseconds) * 1_000_000;
        let interval = window_nanos.div_ceil(u128::from(max_requests.get()));
        let interval = u64::try_from(interval).map_err(|_| {
            ReportflowError::configuration("rate_limit.per_milliseconds is too large")
        })?;
        Quota::with_period(Duration::from_nanos(interval)).ok_or_else(|| {
            ReportflowError::configuration("rate_limit.per_milliseconds must be greater than 0")
        })
    }
}

/// A rate limiter shared by all clients that hold a clone.
///
/// Callers that arrive early wait for their slot; nothing is dropped.
#[derive(Clone)]
pub struct SharedRateLimiter {
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, MonotonicClock, NoOpMiddleware<std::time::Instant>>>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for SharedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

impl SharedRateLimiter {
    /// Creates a limiter from configuration.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        let limiter = RateLimiter::direct_with_clock(config.quota()?, &MonotonicClock);
        Ok(Self {
            limiter: Arc::new(limiter),
            config,
        })
    }

    /// Waits for the next free slot and takes it.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }
}

/// Wraps a client so that every request first waits on a shared limiter.
pub struct RateLimitedClient<C> {
    inner: C,
    limiter: SharedRateLimiter,
}

impl<C> RateLimitedClient<C> {
    /// Creates a rate limited client.
    pub fn new(inner: C, limiter: SharedRateLimiter) -> Self {
        Self { inner, limiter }
    }

    /// Returns the shared limiter.
    pub fn limiter(&self) -> &SharedRateLimiter {
        &self.limiter
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for RateLimitedClient<C> {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        self.limiter.acquire().await;
        tracing::debug!(
            method = %request.method,
            url = %request.url,
            "Rate limiter slot acquired"
        );
        self.inner.send(request).await
    }
}
