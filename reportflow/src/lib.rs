//! # Reportflow
//!
//! Fetches an asynchronously generated report and streams its records
//! through a staged transformation pipeline.
//!
//! Reportflow provides:
//!
//! - **Job lifecycle**: submit a report request, poll until ready, save the payload
//! - **Retry and backoff**: one controller for polling and for transport retries
//! - **Shared rate limiting**: every outbound call draws from one token bucket
//! - **Streaming pipeline**: parse, enrich, remap, dispatch and persist record by record
//! - **Injected observability**: components report through an [`events::EventSink`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reportflow::prelude::*;
//!
//! let mut config = ReportflowConfig::load_or_default("config/default.json")?;
//! config.apply_process_env();
//! config.finalize(chrono::Utc::now());
//!
//! let runner = ReportRunner::from_config(config)?
//!     .with_event_sink(std::sync::Arc::new(LoggingEventSink::debug()));
//! let summary = runner.run().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod errors;
pub mod events;
pub mod http;
pub mod job;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{OutputConfig, OutputFormat, PipelineConfig, ReportflowConfig};
    pub use crate::errors::{ReportflowError, Result, StageError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::http::{
        HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, RateLimitConfig,
        RateLimitedClient, RequestTemplate, SharedRateLimiter,
    };
    pub use crate::job::{JobController, JobState, ReportJob, ReportOutcome, ReportPayload};
    pub use crate::observability::{init_tracing, LoggingConfig};
    pub use crate::pipeline::{
        Emitted, FileSink, JsonArraySource, Pipeline, PipelineBuilder, PipelineResult,
        PipelineStage, Record, RecordSink, RecordSource,
    };
    pub use crate::retry::{BackoffKind, Readiness, RetryConfig, RetryPolicy};
    pub use crate::runner::{ReportRunner, RunSummary};
    pub use crate::stages::{
        DispatchStage, EnrichStage, LookupTable, LrsConfig, MappingExpression, RemapStage,
        TemplateExpression,
    };
}
