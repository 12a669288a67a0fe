//! Streaming record pipeline.
//!
//! A [`Pipeline`] pulls records one at a time from a [`RecordSource`], pushes
//! each through an ordered list of [`PipelineStage`]s depth-first, and writes
//! whatever reaches the end into a [`RecordSink`]. Only the record in flight
//! and its expansions are held in memory.
//!
//! ```rust,ignore
//! let pipeline = PipelineBuilder::new("transform")
//!     .stage(EnrichStage::new(lookup))
//!     .stage(RemapStage::new(expression, bindings))
//!     .log_every(1000)
//!     .build()?;
//!
//! let mut source = JsonArraySource::open("report.json").await?;
//! let mut sink = FileSink::create("report_transformed.json", JsonArrayEncoder::new()).await?;
//! let result = pipeline.run(&mut source, &mut sink).await?;
//! ```

mod driver;
mod metrics;
mod sink;
mod source;


pub use driver::{Pipeline, PipelineBuilder, PipelineResult};
pub use metrics::{PipelineMetrics, StageCounter};
pub use sink::{CsvEncoder, FileSink, JsonArrayEncoder, RecordEncoder, RecordSink, SinkOutcome};
pub(crate) use sink::{json_kind, staging_path};
pub use source::{JsonArraySource, MemorySource, RecordSource};

use async_trait::async_trait;

use crate::errors::StageError;

/// A record flowing through the pipeline.
pub type Record = serde_json::Value;

/// Records produced by one stage call, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Emitted(Vec<Record>);

impl Emitted {
    /// Nothing is forwarded.
    #[must_use]
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// Forwards one record.
    #[must_use]
    pub fn one(record: Record) -> Self {
        Self(vec![record])
    }

    /// Forwards several records.
    #[must_use]
    pub fn many(records: Vec<Record>) -> Self {
        Self(records)
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing is forwarded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the records.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.0
    }
}

impl From<Vec<Record>> for Emitted {
    fn from(records: Vec<Record>) -> Self {
        Self(records)
    }
}

impl IntoIterator for Emitted {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// One processing step.
///
/// A stage takes ownership of each record and forwards zero or more records
/// downstream. An error aborts the whole run.
#[async_trait]
pub trait PipelineStage: Send + Sync + std::fmt::Debug {
    /// Returns the stage name used in logs, metrics and errors.
    fn name(&self) -> &str;

    /// Processes one record. `ordinal` is the 1-based position of the source
    /// record this one descends from.
    async fn process(&self, record: Record, ordinal: u64) -> Result<Emitted, StageError>;

    /// Called once after the source is exhausted; buffered records are
    /// forwarded from here.
    async fn flush(&self) -> Result<Emitted, StageError> {
        Ok(Emitted::none())
    }
}
