//! Event sinks for run observability.
//!
//! Components receive an `Arc<dyn EventSink>` at construction and report
//! retries, progress and completion through it. There is no process-wide
//! sink; a component without one uses [`NoOpEventSink`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use std::sync::Arc;

/// Returns a sink that discards everything.
#[must_use]
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpEventSink)
}

/// Event type names emitted by reportflow components.
pub mod event_types {
    /// A call is about to be retried.
    pub const RETRY_ATTEMPT: &str = "retry.attempt";
    /// A retry chain gave up.
    pub const RETRY_EXHAUSTED: &str = "retry.exhausted";
    /// The job state machine moved to a new state.
    pub const JOB_TRANSITION: &str = "job.transition";
    /// A stage reached its progress cadence.
    pub const PIPELINE_PROGRESS: &str = "pipeline.progress";
    /// A pipeline run completed.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A pipeline run aborted.
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
}
