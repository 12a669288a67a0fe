//! Where run events go: nowhere, the log, or a buffer for assertions.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn, Level};

use super::event_types;

/// Receives the events a report run reports: retry attempts, job state
/// transitions and pipeline progress.
///
/// Emission never fails the run. A sink that cannot deliver an event drops it.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers `event_type` (one of [`event_types`]) with its payload.
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Delivers without awaiting; used from synchronous code such as the
    /// pipeline driver's progress reporting.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes run events to the `tracing` log.
///
/// Retry exhaustion and pipeline failures always log at `WARN`; everything
/// else logs at the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Logs routine events at `DEBUG` when `level` is `DEBUG` or more
    /// verbose, otherwise at `INFO`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Logs routine events at `DEBUG`, which keeps per-record progress out of
    /// the default output.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn is_failure(event_type: &str) -> bool {
        event_type == event_types::RETRY_EXHAUSTED || event_type == event_types::PIPELINE_FAILED
    }

    fn log_event(&self, event_type: &str, data: Option<&Value>) {
        let data = data.map(Value::to_string).unwrap_or_default();
        if Self::is_failure(event_type) {
            warn!(event = event_type, %data, "Run event {event_type}");
        } else if self.level >= Level::DEBUG {
            debug!(event = event_type, %data, "Run event {event_type}");
        } else {
            info!(event = event_type, %data, "Run event {event_type}");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Keeps every event in arrival order so tests can assert on what a run
/// reported.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events whose type starts with `type_prefix`, so `"pipeline."` selects
    /// progress, completion and failure together.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(event_type, _)| event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Payloads of the events of exactly `event_type`. Events without a
    /// payload are skipped.
    #[must_use]
    pub fn payloads(&self, event_type: &str) -> Vec<Value> {
        self.events
            .read()
            .iter()
            .filter(|(kind, _)| kind == event_type)
            .filter_map(|(_, data)| data.clone())
            .collect()
    }

    fn push(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.push(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.push(event_type, data);
    }
}
