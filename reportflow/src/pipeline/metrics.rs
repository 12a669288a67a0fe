//! Per-run pipeline counters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Monotonic counters for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCounter {
    /// Stage name.
    pub stage: String,
    /// Records handed to the stage.
    pub records_in: u64,
    /// Records the stage forwarded.
    pub records_out: u64,
    /// Time spent inside the stage, in milliseconds.
    pub busy_ms: f64,
}

impl StageCounter {
    /// Creates a zeroed counter.
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Self::default()
        }
    }

    /// Counts one processed record and what it produced.
    pub fn record(&mut self, emitted: usize, elapsed: Duration) {
        self.records_in += 1;
        self.records_out += emitted as u64;
        self.busy_ms += elapsed.as_secs_f64() * 1000.0;
    }

    /// Counts records forwarded from a flush.
    pub fn record_flush(&mut self, emitted: usize) {
        self.records_out += emitted as u64;
    }

    /// Returns true if the input count just reached a multiple of `every`.
    #[must_use]
    pub fn at_cadence(&self, every: u64) -> bool {
        every > 0 && self.records_in > 0 && self.records_in % every == 0
    }
}

/// Counters for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Records pulled from the source.
    pub records_read: u64,
    /// Records accepted by the sink.
    pub records_written: u64,
    /// One counter per stage, in pipeline order.
    pub stages: Vec<StageCounter>,
    /// Wall-clock duration of the run, in milliseconds.
    pub duration_ms: f64,
}

impl PipelineMetrics {
    /// Creates zeroed counters for the given stages.
    #[must_use]
    pub fn for_stages<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            stages: names.into_iter().map(StageCounter::new).collect(),
            ..Self::default()
        }
    }

    /// Returns the counter of a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageCounter> {
        self.stages.iter().find(|counter| counter.stage == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_cadence() {
        let mut counter = StageCounter::new("enrich");
        assert!(!counter.at_cadence(2));

        counter.record(1, Duration::from_millis(1));
        assert!(!counter.at_cadence(2));
        counter.record(2, Duration::from_millis(1));
        assert!(counter.at_cadence(2));
        assert!(!counter.at_cadence(0));

        assert_eq!(counter.records_in, 2);
        assert_eq!(counter.records_out, 3);
        assert!(counter.busy_ms >= 2.0);
    }

    #[test]
    fn test_metrics_lookup() {
        let metrics = PipelineMetrics::for_stages(["enrich", "remap"]);
        assert_eq!(metrics.stages.len(), 2);
        assert_eq!(metrics.stage("remap").map(|c| c.records_in), Some(0));
        assert!(metrics.stage("dispatch").is_none());
    }
}
