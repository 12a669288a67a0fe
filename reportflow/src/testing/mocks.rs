//! Mock collaborators for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::errors::{Result, StageError};
use crate::http::{HttpClient, HttpError, HttpRequest, HttpResponse, NoResponseKind};
use crate::pipeline::{Emitted, PipelineStage, Record, RecordSink, SinkOutcome};

/// One canned reply of a [`ScriptedHttpClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// A 2xx response.
    Ok {
        /// Status code.
        status: u16,
        /// Body.
        body: serde_json::Value,
    },
    /// A non-2xx response.
    Status {
        /// Status code.
        status: u16,
        /// Body.
        body: serde_json::Value,
    },
    /// No response at all.
    NoResponse(NoResponseKind),
}

impl ScriptedReply {
    fn resolve(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        match self {
            Self::Ok { status, body } => Ok(HttpResponse::new(*status, body.clone())),
            Self::Status { status, body } => {
                Err(HttpError::status_error(request, *status, body.clone()))
            }
            Self::NoResponse(kind) => Err(HttpError::no_response(request, *kind, "scripted")),
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<ScriptedReply>,
    fallback: Option<ScriptedReply>,
    requests: Vec<HttpRequest>,
}

/// An HTTP client that replays scripted replies in order and records every
/// request it receives.
///
/// Clones share one script, so a clone handed to the code under test can be
/// inspected afterwards. Once the script runs out the fallback reply is
/// used; without one, requests fail with a no-response error.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHttpClient {
    script: Arc<Mutex<Script>>,
}

impl ScriptedHttpClient {
    /// Creates a client with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client that answers every request with 200 and `body`.
    #[must_use]
    pub fn always_ok(body: serde_json::Value) -> Self {
        Self::new().with_fallback(ScriptedReply::Ok { status: 200, body })
    }

    /// Appends a 200 reply.
    #[must_use]
    pub fn with_ok(self, body: serde_json::Value) -> Self {
        self.with_reply(ScriptedReply::Ok { status: 200, body })
    }

    /// Appends a non-2xx reply.
    #[must_use]
    pub fn with_status(self, status: u16, body: serde_json::Value) -> Self {
        self.with_reply(ScriptedReply::Status { status, body })
    }

    /// Appends a no-response failure.
    #[must_use]
    pub fn with_no_response(self, kind: NoResponseKind) -> Self {
        self.with_reply(ScriptedReply::NoResponse(kind))
    }

    /// Appends a reply.
    #[must_use]
    pub fn with_reply(self, reply: ScriptedReply) -> Self {
        self.script.lock().replies.push_back(reply);
        self
    }

    /// Sets the reply used once the script is exhausted.
    #[must_use]
    pub fn with_fallback(self, reply: ScriptedReply) -> Self {
        self.script.lock().fallback = Some(reply);
        self
    }

    /// Returns the number of requests received.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.script.lock().requests.len()
    }

    /// Returns the requests received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.script.lock().requests.clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        let reply = {
            let mut script = self.script.lock();
            script.requests.push(request.clone());
            script.replies.pop_front().or_else(|| script.fallback.clone())
        };

        match reply {
            Some(reply) => reply.resolve(request),
            None => Err(HttpError::no_response(
                request,
                NoResponseKind::Other,
                "script exhausted",
            )),
        }
    }
}

/// A stage that forwards records unchanged and remembers what it saw.
#[derive(Debug)]
pub struct RecordingStage {
    name: String,
    seen: Mutex<Vec<(u64, Record)>>,
}

impl RecordingStage {
    /// Creates a new recording stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Returns the ordinals and records seen, in order.
    #[must_use]
    pub fn seen(&self) -> Vec<(u64, Record)> {
        self.seen.lock().clone()
    }

    /// Returns the number of records seen.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl PipelineStage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        record: Record,
        ordinal: u64,
    ) -> std::result::Result<Emitted, StageError> {
        self.seen.lock().push((ordinal, record.clone()));
        Ok(Emitted::one(record))
    }
}

/// A stage that fails on one source ordinal and forwards everything else.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    fail_at: u64,
    error: String,
}

impl FailingStage {
    /// Creates a stage failing at `fail_at` with `error`.
    #[must_use]
    pub fn new(name: impl Into<String>, fail_at: u64, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_at,
            error: error.into(),
        }
    }
}

#[async_trait]
impl PipelineStage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        record: Record,
        ordinal: u64,
    ) -> std::result::Result<Emitted, StageError> {
        if ordinal == self.fail_at {
            return Err(StageError::new(&self.name, &self.error));
        }
        Ok(Emitted::one(record))
    }
}

#[derive(Debug, Default)]
struct MemorySinkState {
    records: Vec<Record>,
    finished: bool,
    aborted: bool,
}

/// A sink that keeps records in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the records written.
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        self.state.lock().records.clone()
    }

    /// Returns true once `finish` was called.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Returns true once `abort` was called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write(&mut self, record: &Record) -> Result<()> {
        self.state.lock().records.push(record.clone());
        Ok(())
    }

    async fn finish(&mut self) -> Result<SinkOutcome> {
        let mut state = self.state.lock();
        state.finished = true;
        let written = state.records.len() as u64;
        Ok(SinkOutcome {
            records_written: written,
            path: None,
            saved: written > 0,
        })
    }

    async fn abort(&mut self) {
        let mut state = self.state.lock();
        state.aborted = true;
        state.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_client_replays_in_order() {
        let client = ScriptedHttpClient::new()
            .with_ok(json!({"id": "r1"}))
            .with_status(503, json!("busy"))
            .with_no_response(NoResponseKind::Timeout);
        let request = HttpRequest::new(HttpMethod::Get, "https://api.example.com/x");

        assert_eq!(client.send(&request).await.unwrap().body, json!({"id": "r1"}));
        assert_eq!(client.send(&request).await.unwrap_err().status(), Some(503));
        assert!(client.send(&request).await.unwrap_err().is_no_response());
        assert!(client.send(&request).await.unwrap_err().is_no_response());
        assert_eq!(client.call_count(), 4);
    }

    #[tokio::test]
    async fn test_clones_share_the_script() {
        let client = ScriptedHttpClient::always_ok(json!({}));
        let clone = client.clone();
        let request = HttpRequest::new(HttpMethod::Post, "https://api.example.com/x");

        clone.send(&request).await.unwrap();
        assert_eq!(client.call_count(), 1);
        assert_eq!(client.requests()[0].method, HttpMethod::Post);
    }
}
