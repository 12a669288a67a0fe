//! Error types for reportflow.
//!
//! The taxonomy follows the life of a run: transport and HTTP failures are
//! resolved by the retry controller up to its caps, job-level failures come
//! from the reporting service itself, and stage failures abort a pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::http::HttpError;

/// The main error type for reportflow operations.
#[derive(Debug, Error)]
pub enum ReportflowError {
    /// An HTTP call failed, with or without a server response.
    #[error("{0}")]
    Http(#[from] HttpError),

    /// The retry cap was reached while the report was still being generated.
    #[error(
        "Report {report_id} still in progress after {attempts} attempts \
         (correlation id: {correlation_id})"
    )]
    JobInProgress {
        /// The report request id.
        report_id: String,
        /// The correlation id of the poll chain.
        correlation_id: Uuid,
        /// Poll attempts made.
        attempts: u32,
    },

    /// The reporting service declared the report failed.
    #[error("Report {report_id} failed: {body}")]
    JobFailed {
        /// The report request id.
        report_id: String,
        /// The body returned with the failed status.
        body: serde_json::Value,
    },

    /// A success response did not carry what the caller needed.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// A terminal error at the end of a retry chain.
    #[error(
        "{label} gave up after {attempts} attempt(s) \
         (correlation id: {correlation_id}): {source}"
    )]
    Call {
        /// What was being called.
        label: String,
        /// The correlation id of the attempt chain.
        correlation_id: Uuid,
        /// Attempts made, including the first.
        attempts: u32,
        /// The error of the last attempt.
        #[source]
        source: Box<ReportflowError>,
    },

    /// A pipeline stage failed while processing a record.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// Configuration is missing or invalid; nothing was started.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A state machine invariant was violated.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV encoding error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReportflowError {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Returns the innermost error, looking through `Call` wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Call { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the attempt count recorded on a retry chain, if any.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Call { attempts, .. } | Self::JobInProgress { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Converts to a dictionary representation for diagnostics.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::Call {
                label,
                correlation_id,
                attempts,
                source,
            } => {
                map.insert("type".to_string(), serde_json::json!("Call"));
                map.insert("label".to_string(), serde_json::json!(label));
                map.insert(
                    "correlation_id".to_string(),
                    serde_json::json!(correlation_id.to_string()),
                );
                map.insert("attempts".to_string(), serde_json::json!(attempts));
                let inner: serde_json::Map<String, serde_json::Value> =
                    source.to_dict().into_iter().collect();
                map.insert("source".to_string(), serde_json::Value::Object(inner));
            }
            Self::JobInProgress {
                report_id,
                correlation_id,
                attempts,
            } => {
                map.insert("type".to_string(), serde_json::json!("JobInProgress"));
                map.insert("report_id".to_string(), serde_json::json!(report_id));
                map.insert(
                    "correlation_id".to_string(),
                    serde_json::json!(correlation_id.to_string()),
                );
                map.insert("attempts".to_string(), serde_json::json!(attempts));
            }
            Self::JobFailed { report_id, body } => {
                map.insert("type".to_string(), serde_json::json!("JobFailed"));
                map.insert("report_id".to_string(), serde_json::json!(report_id));
                map.insert("body".to_string(), body.clone());
            }
            Self::Stage(err) => {
                map.insert("type".to_string(), serde_json::json!("Stage"));
                map.insert("stage".to_string(), serde_json::json!(err.stage));
                if let Some(ordinal) = err.ordinal {
                    map.insert("ordinal".to_string(), serde_json::json!(ordinal));
                }
            }
            Self::Http(err) => {
                map.insert("type".to_string(), serde_json::json!("Http"));
                if let Some(status) = err.status() {
                    map.insert("status".to_string(), serde_json::json!(status));
                }
            }
            Self::MalformedResponse(_) => {
                map.insert("type".to_string(), serde_json::json!("MalformedResponse"));
            }
            Self::Configuration(_) => {
                map.insert("type".to_string(), serde_json::json!("Configuration"));
            }
            Self::Internal(_) => {
                map.insert("type".to_string(), serde_json::json!("Internal"));
            }
            Self::Serialization(_) | Self::Csv(_) => {
                map.insert("type".to_string(), serde_json::json!("Serialization"));
            }
            Self::Io(_) => {
                map.insert("type".to_string(), serde_json::json!("Io"));
            }
        }

        map
    }
}

/// Result alias used across the crate.
pub type Result<T, E = ReportflowError> = std::result::Result<T, E>;

/// Error raised by a pipeline stage while processing one record.
///
/// Stage errors always abort the whole pipeline.
#[derive(Debug)]
pub struct StageError {
    /// The name of the failing stage.
    pub stage: String,
    /// The source ordinal of the record being processed, when known.
    pub ordinal: Option<u64>,
    /// The error message.
    pub message: String,
    /// The underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Stage '{}' failed", self.stage)?;
        if let Some(ordinal) = self.ordinal {
            write!(f, " at record {ordinal}")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ordinal: None,
            message: message.into(),
            source: None,
        }
    }

    /// Sets the record ordinal.
    #[must_use]
    pub fn with_ordinal(mut self, ordinal: u64) -> Self {
        self.ordinal = Some(ordinal);
        self
    }

    /// Sets the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Builds a stage error from any displayable cause, keeping it as the source.
    #[must_use]
    pub fn from_error(
        stage: impl Into<String>,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::new(stage, err.to_string()).with_source(err)
    }
}

/// Diagnostic snapshot of a terminal failure, suitable for structured logs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FailureReport {
    /// Error message.
    pub message: String,
    /// Correlation id of the failing call chain, if any.
    pub correlation_id: Option<String>,
    /// Attempts made, if the failure came out of a retry chain.
    pub attempts: Option<u32>,
    /// The failing stage, if the failure came out of a pipeline.
    pub stage: Option<String>,
}

impl From<&ReportflowError> for FailureReport {
    fn from(err: &ReportflowError) -> Self {
        let correlation_id = match err {
            ReportflowError::Call { correlation_id, .. }
            | ReportflowError::JobInProgress { correlation_id, .. } => {
                Some(correlation_id.to_string())
            }
            _ => None,
        };
        let stage = match err.root() {
            ReportflowError::Stage(stage_err) => Some(stage_err.stage.clone()),
            _ => None,
        };

        Self {
            message: err.to_string(),
            correlation_id,
            attempts: err.attempts(),
            stage,
        }
    }
}
