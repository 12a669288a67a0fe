//! Per-record delivery to a learning record store.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{ReportflowError, Result, StageError};
use crate::http::{HttpClient, HttpMethod, HttpRequest};
use crate::pipeline::{Emitted, PipelineStage, Record};
use crate::retry::RetryPolicy;

const STAGE_NAME: &str = "dispatch";
const XAPI_VERSION: &str = "1.0.0";

fn default_lrs_timeout_ms() -> u64 {
    20_000
}

/// Learning record store connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LrsConfig {
    /// Statements endpoint.
    #[serde(default)]
    pub endpoint: String,
    /// Basic auth user.
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// A complete `Authorization` header value; overrides user and password.
    #[serde(default)]
    pub auth: Option<String>,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_lrs_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LrsConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: None,
            password: None,
            auth: None,
            timeout_ms: default_lrs_timeout_ms(),
        }
    }
}

impl LrsConfig {
    /// Creates a config using Basic credentials.
    #[must_use]
    pub fn basic(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: Some(username.into()),
            password: Some(password.into()),
            auth: None,
            timeout_ms: default_lrs_timeout_ms(),
        }
    }

    /// Returns the `Authorization` header value.
    pub fn credential(&self) -> Result<String> {
        if let Some(auth) = self.auth.as_deref().filter(|a| !a.is_empty()) {
            return Ok(auth.to_string());
        }
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(password)) if !user.is_empty() => {
                Ok(format!("Basic {}", BASE64.encode(format!("{user}:{password}"))))
            }
            _ => Err(ReportflowError::configuration(
                "lrs needs either auth or username and password",
            )),
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(ReportflowError::configuration("lrs.endpoint is required"));
        }
        self.credential().map(|_| ())
    }
}

/// Posts each record to the store and forwards the record with the result.
///
/// Output records have the shape
/// `{statement, dispatchId, httpStatus, remoteResponseBody}`. Calls go
/// through the shared retry policy; a call that still fails aborts the run.
#[derive(Debug)]
pub struct DispatchStage {
    client: Arc<dyn HttpClient>,
    retry: RetryPolicy,
    endpoint: String,
    credential: String,
    timeout: Duration,
    dispatched: AtomicU64,
}

impl DispatchStage {
    /// Creates the stage. The credential is computed once here.
    pub fn new(
        config: &LrsConfig,
        client: Arc<dyn HttpClient>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            retry,
            endpoint: config.endpoint.clone(),
            credential: config.credential()?,
            timeout: Duration::from_millis(config.timeout_ms),
            dispatched: AtomicU64::new(0),
        })
    }

    /// Returns the number of records delivered.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    fn request(&self, statement: &Record) -> HttpRequest {
        HttpRequest::new(HttpMethod::Post, &self.endpoint)
            .with_header("Authorization", &self.credential)
            .with_header("X-Experience-API-Version", XAPI_VERSION)
            .with_header("Content-Type", "application/json")
            .with_body(statement.clone())
            .with_timeout(self.timeout)
    }
}

#[async_trait]
impl PipelineStage for DispatchStage {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    async fn process(
        &self,
        record: Record,
        ordinal: u64,
    ) -> std::result::Result<Emitted, StageError> {
        let dispatch_id = Uuid::new_v4();
        let request = self.request(&record);
        let client = &self.client;
        let request = &request;

        let response = self
            .retry
            .call(STAGE_NAME, move |_| async move {
                client.send(request).await.map_err(ReportflowError::from)
            })
            .await
            .map_err(|err| StageError::from_error(STAGE_NAME, err).with_ordinal(ordinal))?;

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(
            dispatch_id = %dispatch_id,
            ordinal,
            status = response.status,
            "Record dispatched"
        );

        Ok(Emitted::one(serde_json::json!({
            "statement": record,
            "dispatchId": dispatch_id.to_string(),
            "httpStatus": response.status,
            "remoteResponseBody": response.body,
        })))
    }
}
