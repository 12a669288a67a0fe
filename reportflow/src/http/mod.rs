//! HTTP capability consumed by the job controller and the dispatch stage.
//!
//! The transport itself is injectable: anything implementing [`HttpClient`]
//! can be used, and [`RateLimitedClient`] layers the shared rate limiter on
//! top of any of them.

mod rate_limit;
#[cfg(feature = "http")]
mod reqwest_client;
mod template;

pub use rate_limit::{RateLimitConfig, RateLimitedClient, SharedRateLimiter};
#[cfg(feature = "http")]
pub use reqwest_client::ReqwestHttpClient;
pub use template::{render_uri, RequestTemplate};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    /// GET
    #[default]
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A fully rendered outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL, without the query string.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Query string parameters.
    pub query: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<serde_json::Value>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl HttpRequest {
    /// Creates a request with no headers, query or body and a 2 second timeout.
    #[must_use]
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            timeout: Duration::from_millis(2000),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the JSON body.
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the value of a header, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A response with a 2xx status.
///
/// The body is the parsed JSON document when the payload parses as JSON,
/// and a JSON string holding the raw text otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Decoded body.
    pub body: serde_json::Value,
}

impl HttpResponse {
    /// Creates a response.
    #[must_use]
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    /// Decodes a raw payload the way responses are exposed to callers.
    #[must_use]
    pub fn decode_body(text: String) -> serde_json::Value {
        if text.trim().is_empty() {
            return serde_json::Value::String(text);
        }
        serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
    }
}

/// Why no response was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoResponseKind {
    /// The request timed out.
    Timeout,
    /// The connection could not be established (includes DNS failures).
    Connect,
    /// The connection was reset mid-request.
    Reset,
    /// Any other failure before a response arrived.
    Other,
}

impl fmt::Display for NoResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Reset => "connection reset",
            Self::Other => "no response",
        };
        f.write_str(name)
    }
}

/// A classified HTTP failure.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    /// No server response was received.
    #[error("{method} {url}: {kind}: {message}")]
    NoResponse {
        /// Method of the failed request.
        method: HttpMethod,
        /// URL of the failed request.
        url: String,
        /// Failure class.
        kind: NoResponseKind,
        /// Transport message.
        message: String,
    },

    /// The server answered with a non-2xx status.
    #[error("{method} {url}: HTTP {status}")]
    Status {
        /// Method of the failed request.
        method: HttpMethod,
        /// URL of the failed request.
        url: String,
        /// Response status.
        status: u16,
        /// Decoded response body.
        body: serde_json::Value,
    },
}

impl HttpError {
    /// Creates a no-response error for a request.
    #[must_use]
    pub fn no_response(
        request: &HttpRequest,
        kind: NoResponseKind,
        message: impl Into<String>,
    ) -> Self {
        Self::NoResponse {
            method: request.method,
            url: request.url.clone(),
            kind,
            message: message.into(),
        }
    }

    /// Creates a status error for a request.
    #[must_use]
    pub fn status_error(request: &HttpRequest, status: u16, body: serde_json::Value) -> Self {
        Self::Status {
            method: request.method,
            url: request.url.clone(),
            status,
            body,
        }
    }

    /// Returns the response status, if a response was received.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::NoResponse { .. } => None,
        }
    }

    /// Returns true if no server response was received.
    #[must_use]
    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::NoResponse { .. })
    }

    /// Returns the response body, if a response was received.
    #[must_use]
    pub fn body(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Status { body, .. } => Some(body),
            Self::NoResponse { .. } => None,
        }
    }
}

/// Performs one HTTP request.
///
/// Implementations must return `Ok` only for 2xx responses and classify
/// everything else as an [`HttpError`]. Retrying is not their concern.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends the request.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for std::sync::Arc<C> {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        (**self).send(request).await
    }
}

impl fmt::Debug for dyn HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn HttpClient")
    }
}
