//! Report job lifecycle: submit, poll until ready, materialize.
//!
//! One [`JobController::submit_and_await`] call drives a [`ReportJob`]
//! through `Created -> Submitted -> Polling -> Ready | Failed`. Polling is a
//! retry chain whose attempts return [`Readiness::InProgress`] until the
//! service hands back the report.

mod materialize;

pub use materialize::{materialize, ReportOutcome};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::REPORT_REQUEST_ID;
use crate::errors::{ReportflowError, Result};
use crate::events::{event_types, noop_sink, EventSink};
use crate::http::{HttpClient, RequestTemplate};
use crate::retry::{Readiness, RetryPolicy};

const IN_PROGRESS: &str = "IN_PROGRESS";
const FAILED: &str = "FAILED";

/// Lifecycle state of a report job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Not yet submitted.
    Created,
    /// The service accepted the request and assigned an id.
    Submitted,
    /// Waiting for the report.
    Polling,
    /// The report is available.
    Ready,
    /// The job ended without a report.
    Failed,
}

impl JobState {
    /// Returns true for `Ready` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Returns true if `self -> next` moves the job forward. `Polling` may
    /// repeat; nothing leaves a terminal state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Submitted)
                | (Self::Submitted | Self::Polling, Self::Polling)
                | (Self::Polling, Self::Ready)
                | (Self::Created | Self::Submitted | Self::Polling, Self::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One submit-and-poll cycle.
#[derive(Debug, Clone)]
pub struct ReportJob {
    /// Identifies the job in logs and events.
    pub correlation_id: Uuid,
    /// Submission request.
    pub submission: RequestTemplate,
    /// Poll request; `{reportRequestId}` is filled in after submission.
    pub poll: RequestTemplate,
    /// Assigned by the service on submission.
    pub report_request_id: Option<String>,
    state: JobState,
}

impl ReportJob {
    /// Creates a job in the `Created` state.
    #[must_use]
    pub fn new(submission: RequestTemplate, poll: RequestTemplate) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            submission,
            poll,
            report_request_id: None,
            state: JobState::Created,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Moves the job to `next`, rejecting regressions.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ReportflowError::Internal(format!(
                "job {} cannot move from {} to {next}",
                self.correlation_id, self.state
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// What a successful poll returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportPayload {
    /// A structured report.
    Json(Value),
    /// A pre-rendered flat file such as CSV.
    Text(String),
    /// Neither structured nor text; nothing can be saved.
    Unsupported(Value),
}

impl ReportPayload {
    /// Interprets a response body.
    #[must_use]
    pub fn from_body(body: Value) -> Self {
        match body {
            Value::Object(_) | Value::Array(_) => Self::Json(body),
            Value::String(text) => Self::Text(text),
            other => Self::Unsupported(other),
        }
    }
}

/// Classifies a poll response body.
///
/// An object with a `status` of `IN_PROGRESS` (any case) is not ready yet,
/// `FAILED` (any case) is a terminal [`ReportflowError::JobFailed`], and a
/// body without a `status` field is the report itself. Any other status is
/// a malformed response.
pub fn classify_poll_body(report_id: &str, body: Value) -> Result<Readiness<ReportPayload>> {
    let status = match body.as_object().and_then(|fields| fields.get("status")) {
        None => return Ok(Readiness::Ready(ReportPayload::from_body(body))),
        Some(status) => status.as_str().unwrap_or_default().to_string(),
    };

    if status.eq_ignore_ascii_case(IN_PROGRESS) {
        Ok(Readiness::InProgress)
    } else if status.eq_ignore_ascii_case(FAILED) {
        Err(ReportflowError::JobFailed {
            report_id: report_id.to_string(),
            body,
        })
    } else {
        Err(ReportflowError::MalformedResponse(format!(
            "report {report_id} returned unexpected status '{status}'"
        )))
    }
}

fn submission_id(body: &Value) -> Result<String> {
    match body.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(ReportflowError::MalformedResponse(
            "submission response has no report id".to_string(),
        )),
    }
}

/// Drives report jobs against the reporting service.
#[derive(Clone)]
pub struct JobController {
    client: Arc<dyn HttpClient>,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for JobController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobController")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl JobController {
    /// Creates a controller.
    #[must_use]
    pub fn new(client: Arc<dyn HttpClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            events: noop_sink(),
        }
    }

    /// Sets the event sink for state transitions.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    fn advance(&self, job: &mut ReportJob, next: JobState) -> Result<()> {
        let from = job.state();
        job.transition(next)?;
        self.events.try_emit(
            event_types::JOB_TRANSITION,
            Some(serde_json::json!({
                "correlation_id": job.correlation_id.to_string(),
                "report_request_id": job.report_request_id,
                "from": from,
                "to": next,
            })),
        );
        Ok(())
    }

    /// Submits the job and waits for its report.
    ///
    /// Ends with the job `Ready` and the report payload, or `Failed` and the
    /// error: a terminal HTTP failure, [`ReportflowError::JobFailed`], or
    /// [`ReportflowError::JobInProgress`] when the attempt cap ran out while
    /// the report was still being generated.
    pub async fn submit_and_await(&self, job: &mut ReportJob) -> Result<ReportPayload> {
        match self.drive(job).await {
            Ok(payload) => Ok(payload),
            Err(err) => {
                error!(
                    correlation_id = %job.correlation_id,
                    report_request_id = ?job.report_request_id,
                    error = %err,
                    "Report job failed"
                );
                if !job.state().is_terminal() {
                    self.advance(job, JobState::Failed)?;
                }
                Err(err)
            }
        }
    }

    async fn drive(&self, job: &mut ReportJob) -> Result<ReportPayload> {
        let client = &self.client;

        let submit_request = job.submission.render()?;
        let request = &submit_request;
        let response = self
            .retry
            .call("submit", move |_| async move {
                client.send(request).await.map_err(ReportflowError::from)
            })
            .await?;
        let report_id = submission_id(&response.body)?;
        info!(correlation_id = %job.correlation_id, report_id = %report_id, "Report submitted");
        job.report_request_id = Some(report_id.clone());
        self.advance(job, JobState::Submitted)?;

        let poll_request = job
            .poll
            .clone()
            .with_path_value(REPORT_REQUEST_ID, report_id.as_str())
            .render()?;
        self.advance(job, JobState::Polling)?;

        let request = &poll_request;
        let id = report_id.as_str();
        let attempted = self
            .retry
            .run("poll", move |_| async move {
                let response = client.send(request).await?;
                classify_poll_body(id, response.body)
            })
            .await?;

        match attempted.outcome {
            Readiness::Ready(payload) => {
                self.advance(job, JobState::Ready)?;
                info!(
                    correlation_id = %job.correlation_id,
                    report_id = %report_id,
                    attempts = attempted.context.attempt_count,
                    "Report ready"
                );
                Ok(payload)
            }
            Readiness::InProgress => Err(ReportflowError::JobInProgress {
                report_id,
                correlation_id: attempted.context.correlation_id,
                attempts: attempted.context.attempt_count,
            }),
        }
    }
}
