//! The pipeline driver.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use super::{PipelineMetrics, PipelineStage, Record, RecordSink, RecordSource};
use crate::errors::{FailureReport, ReportflowError, Result, StageError};
use crate::events::{event_types, noop_sink, EventSink};

const SOURCE_STEP: &str = "parse";
const SINK_STEP: &str = "sink";

fn default_log_every() -> u64 {
    1000
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Box<dyn PipelineStage>>,
    log_every: u64,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("log_every", &self.log_every)
            .finish_non_exhaustive()
    }
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            log_every: default_log_every(),
            events: noop_sink(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(self, stage: impl PipelineStage + 'static) -> Self {
        self.boxed_stage(Box::new(stage))
    }

    /// Appends an already boxed stage.
    #[must_use]
    pub fn boxed_stage(mut self, stage: Box<dyn PipelineStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sets the progress cadence, in records per stage.
    #[must_use]
    pub fn log_every(mut self, every: u64) -> Self {
        self.log_every = every;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero progress cadence or duplicate
    /// stage names.
    pub fn build(self) -> Result<Pipeline> {
        if self.log_every == 0 {
            return Err(ReportflowError::configuration(
                "pipeline.log_every must be greater than 0",
            ));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            if self.stages[..index]
                .iter()
                .any(|other| other.name() == stage.name())
            {
                return Err(ReportflowError::configuration(format!(
                    "Pipeline '{}' has two stages named '{}'",
                    self.name,
                    stage.name()
                )));
            }
        }

        Ok(Pipeline {
            name: self.name,
            stages: self.stages,
            log_every: self.log_every,
            events: self.events,
        })
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Records written to the sink.
    pub records_processed: u64,
    /// The artifact path, when something was saved.
    pub output_path: Option<PathBuf>,
    /// Whether an artifact was kept.
    pub saved: bool,
    /// Counters of the run.
    pub metrics: PipelineMetrics,
}

/// An ordered list of stages driven record by record.
///
/// Each source record is pushed through every stage before the next one is
/// read, so records leave in source order and a slow sink holds back the
/// source. Any stage error aborts the run and discards the sink's output.
pub struct Pipeline {
    name: String,
    stages: Vec<Box<dyn PipelineStage>>,
    log_every: u64,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .field("log_every", &self.log_every)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Runs the pipeline to completion.
    pub async fn run(
        &self,
        source: &mut dyn RecordSource,
        sink: &mut dyn RecordSink,
    ) -> Result<PipelineResult> {
        let started = Instant::now();
        let mut metrics = PipelineMetrics::for_stages(self.stage_names());
        info!(pipeline = %self.name, stages = ?self.stage_names(), "Pipeline started");

        let driven = match self.drive(source, sink, &mut metrics).await {
            Ok(()) => sink.finish().await,
            Err(err) => Err(err),
        };

        metrics.duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(err) => {
                sink.abort().await;
                error!(
                    pipeline = %self.name,
                    records_read = metrics.records_read,
                    error = %err,
                    "Pipeline aborted"
                );
                self.events.try_emit(
                    event_types::PIPELINE_FAILED,
                    Some(serde_json::json!({
                        "pipeline": self.name,
                        "records_read": metrics.records_read,
                        "failure": FailureReport::from(&err),
                    })),
                );
                return Err(err);
            }
        };

        info!(
            pipeline = %self.name,
            records_read = metrics.records_read,
            records_written = outcome.records_written,
            saved = outcome.saved,
            duration_ms = metrics.duration_ms,
            "Pipeline completed"
        );
        self.events.try_emit(
            event_types::PIPELINE_COMPLETED,
            Some(serde_json::json!({
                "pipeline": self.name,
                "records_read": metrics.records_read,
                "records_written": outcome.records_written,
                "saved": outcome.saved,
            })),
        );

        Ok(PipelineResult {
            records_processed: outcome.records_written,
            output_path: outcome.path,
            saved: outcome.saved,
            metrics,
        })
    }

    async fn drive(
        &self,
        source: &mut dyn RecordSource,
        sink: &mut dyn RecordSink,
        metrics: &mut PipelineMetrics,
    ) -> Result<()> {
        let mut ordinal = 0;

        loop {
            let record = source.next_record().await.map_err(|err| {
                StageError::from_error(SOURCE_STEP, err).with_ordinal(ordinal + 1)
            })?;
            let Some(record) = record else { break };
            ordinal += 1;
            metrics.records_read += 1;
            if metrics.records_read % self.log_every == 0 {
                self.report_progress(SOURCE_STEP, metrics.records_read);
            }
            self.push(0, vec![record], ordinal, sink, metrics).await?;
        }

        for (index, stage) in self.stages.iter().enumerate() {
            let flushed = stage.flush().await?;
            if flushed.is_empty() {
                continue;
            }
            debug!(
                pipeline = %self.name,
                stage = stage.name(),
                records = flushed.len(),
                "Stage flushed"
            );
            metrics.stages[index].record_flush(flushed.len());
            self.push(index + 1, flushed.into_records(), ordinal, sink, metrics)
                .await?;
        }

        Ok(())
    }

    /// Pushes records into the stage at `from` and follows every emission
    /// to the sink before taking the next record.
    async fn push(
        &self,
        from: usize,
        records: Vec<Record>,
        ordinal: u64,
        sink: &mut dyn RecordSink,
        metrics: &mut PipelineMetrics,
    ) -> Result<()> {
        let mut pending: Vec<(usize, Record)> =
            records.into_iter().rev().map(|record| (from, record)).collect();

        while let Some((index, record)) = pending.pop() {
            let Some(stage) = self.stages.get(index) else {
                sink.write(&record).await.map_err(|err| {
                    StageError::from_error(SINK_STEP, err).with_ordinal(ordinal)
                })?;
                metrics.records_written += 1;
                if metrics.records_written % self.log_every == 0 {
                    self.report_progress(SINK_STEP, metrics.records_written);
                }
                continue;
            };

            let started = Instant::now();
            let emitted = stage.process(record, ordinal).await.map_err(|mut err| {
                err.ordinal.get_or_insert(ordinal);
                err
            })?;

            let counter = &mut metrics.stages[index];
            counter.record(emitted.len(), started.elapsed());
            if counter.at_cadence(self.log_every) {
                self.report_progress(&counter.stage, counter.records_in);
            }

            pending.extend(emitted.into_iter().rev().map(|record| (index + 1, record)));
        }

        Ok(())
    }

    /// Progress of one step: the source, a stage, or the sink.
    fn report_progress(&self, step: &str, processed: u64) {
        info!(
            pipeline = %self.name,
            stage = step,
            processed,
            "Processed {processed} records"
        );
        self.events.try_emit(
            event_types::PIPELINE_PROGRESS,
            Some(serde_json::json!({
                "pipeline": self.name,
                "stage": step,
                "processed": processed,
            })),
        );
    }
}
