//! End-to-end runs: fetch a report or read a local one, then transform it.

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{OutputFormat, ReportflowConfig};
use crate::errors::{ReportflowError, Result};
use crate::events::{noop_sink, EventSink};
use crate::http::{HttpClient, RateLimitedClient, SharedRateLimiter};
use crate::job::{materialize, JobController, ReportJob, ReportOutcome};
use crate::pipeline::{
    CsvEncoder, FileSink, JsonArrayEncoder, JsonArraySource, Pipeline, PipelineBuilder,
    PipelineResult,
};
use crate::retry::RetryPolicy;
use crate::stages::{
    Bindings, DispatchStage, EnrichStage, LookupTable, RemapStage, TemplateExpression,
};

/// What a run produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    /// The raw report, when it was fetched from the service.
    pub report: Option<ReportOutcome>,
    /// The transformed output, when a transform ran.
    pub transformed: Option<PipelineResult>,
}

/// Runs a configured job.
///
/// Every outbound call, whether report polling or record dispatch, goes
/// through one rate limited client and one retry policy.
pub struct ReportRunner {
    config: ReportflowConfig,
    client: Arc<dyn HttpClient>,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ReportRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportRunner")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ReportRunner {
    /// Creates a runner around `client`, which is wrapped in the configured
    /// rate limiter. The configuration must already be finalized.
    pub fn new(config: ReportflowConfig, client: Arc<dyn HttpClient>) -> Result<Self> {
        config.validate()?;
        let limiter = SharedRateLimiter::new(config.rate_limit)?;
        let client: Arc<dyn HttpClient> = Arc::new(RateLimitedClient::new(client, limiter));
        let retry = RetryPolicy::new(config.retry.clone());
        Ok(Self {
            config,
            client,
            retry,
            events: noop_sink(),
        })
    }

    /// Creates a runner using the production HTTP client.
    #[cfg(feature = "http")]
    pub fn from_config(config: ReportflowConfig) -> Result<Self> {
        let client = crate::http::ReqwestHttpClient::new()?;
        Self::new(config, Arc::new(client))
    }

    /// Sets the event sink used by every component of the run.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.retry = self.retry.with_event_sink(Arc::clone(&events));
        self.events = events;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ReportflowConfig {
        &self.config
    }

    /// Runs the configured path.
    pub async fn run(&self) -> Result<RunSummary> {
        match &self.config.source {
            Some(source) => self.run_local(source).await,
            None => self.run_remote().await,
        }
    }

    async fn run_local(&self, source: &Path) -> Result<RunSummary> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(ReportflowError::configuration(format!(
                "source file not found: {}",
                source.display()
            )));
        }
        info!(source = %source.display(), "Processing local report");
        let transformed = self.transform(source, false).await?;
        Ok(RunSummary {
            report: None,
            transformed: Some(transformed),
        })
    }

    async fn run_remote(&self) -> Result<RunSummary> {
        info!("Requesting report");
        let controller = JobController::new(Arc::clone(&self.client), self.retry.clone())
            .with_event_sink(Arc::clone(&self.events));
        let mut job = ReportJob::new(
            self.config.report_request.clone(),
            self.config.poll_request.clone(),
        );
        let payload = controller.submit_and_await(&mut job).await?;
        let report = materialize(payload, &self.config.output).await?;

        let saved_json = report
            .saved_path()
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .map(Path::to_path_buf);

        let transformed = match (saved_json, &self.config.transform) {
            (Some(path), Some(_)) => Some(self.transform(&path, self.config.lrs.is_some()).await?),
            _ => None,
        };

        Ok(RunSummary {
            report: Some(report),
            transformed,
        })
    }

    async fn lookup_table(&self) -> Result<LookupTable> {
        if let Some(path) = &self.config.lookup {
            LookupTable::load(path).await
        } else {
            warn!("No activity lookup configured, every record gets a fallback object");
            Ok(LookupTable::empty())
        }
    }

    async fn build_pipeline(&self, dispatch: bool) -> Result<Pipeline> {
        let transform = self
            .config
            .transform
            .as_ref()
            .ok_or_else(|| ReportflowError::configuration("no transform configured"))?;
        let expression = TemplateExpression::from_file(transform).await?;
        let lookup = self.lookup_table().await?;

        let mut bindings = Bindings::new();
        bindings.insert("homepage".to_string(), Value::String(self.config.homepage.clone()));

        let mut builder = PipelineBuilder::new("transform")
            .stage(EnrichStage::new(Arc::new(lookup)))
            .stage(RemapStage::new(Arc::new(expression), bindings))
            .log_every(self.config.pipeline.log_every)
            .event_sink(Arc::clone(&self.events));

        if dispatch {
            if let Some(lrs) = &self.config.lrs {
                builder = builder.stage(DispatchStage::new(
                    lrs,
                    Arc::clone(&self.client),
                    self.retry.clone(),
                )?);
            }
        }
        builder.build()
    }

    /// Transforms a JSON array report into `<name>_transformed.<ext>`.
    ///
    /// Records are dispatched to the learning record store only when
    /// `dispatch` is set and one is configured.
    pub async fn transform(&self, source: &Path, dispatch: bool) -> Result<PipelineResult> {
        let pipeline = self.build_pipeline(dispatch).await?;
        let output = self.config.output.transformed_path(self.config.output_format)?;
        let mut records = JsonArraySource::open(source).await?;

        let result = match self.config.output_format {
            OutputFormat::Json => {
                let mut sink = FileSink::create(&output, JsonArrayEncoder::new()).await?;
                pipeline.run(&mut records, &mut sink).await?
            }
            OutputFormat::Csv => {
                let mut sink = FileSink::create(&output, CsvEncoder::new()).await?;
                pipeline.run(&mut records, &mut sink).await?
            }
        };

        if result.saved {
            info!(
                path = %output.display(),
                records = result.records_processed,
                "Transformed records saved"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RateLimitConfig;
    use crate::retry::{BackoffKind, JitterStrategy};
    use crate::stages::LrsConfig;
    use crate::testing::{
        course_records, lookup_entry, write_json_file, ScriptedHttpClient, ScriptedReply,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn transform_template() -> Value {
        json!({
            "actor": {"account": {"homePage": "{{$homepage}}", "name": "{{userId}}"}},
            "object": "{{xapiobject}}",
            "id": "{{xapistatementid}}",
        })
    }

    fn config(dir: &TempDir) -> ReportflowConfig {
        let mut config = ReportflowConfig {
            transform: Some(write_json_file(dir.path(), "transform.json", &transform_template())),
            rate_limit: RateLimitConfig::new(1000, 1000),
            ..ReportflowConfig::default()
        };
        config.output.path = dir.path().join("results");
        config.output.filename = Some("run".to_string());
        config.retry = config
            .retry
            .with_max_attempts(3)
            .with_backoff(BackoffKind::Static, 1)
            .with_jitter(JitterStrategy::None);
        config.pipeline.log_every = 2;
        config
    }

    fn remote(mut config: ReportflowConfig) -> ReportflowConfig {
        let vars = [("BASEURL", "https://api.example.com"), ("ORGID", "org-1"), ("BEARER", "t0k")];
        config.apply_env_overrides(|name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_string())
        });
        config
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_local_source_is_transformed_without_network() {
        let dir = TempDir::new().unwrap();
        let source = write_json_file(dir.path(), "report.json", &json!(course_records(5)));
        let lookup = write_json_file(dir.path(), "lookup.json", &json!([lookup_entry(2)]));
        let mut config = config(&dir);
        config.source = Some(source);
        config.lookup = Some(lookup);
        config.lrs = Some(LrsConfig::basic("https://lrs.example.com/statements", "u", "p"));

        let client = ScriptedHttpClient::new();
        let runner = ReportRunner::new(config, Arc::new(client.clone())).unwrap();
        let summary = runner.run().await.unwrap();

        assert!(summary.report.is_none());
        let transformed = summary.transformed.unwrap();
        assert_eq!(transformed.records_processed, 5);
        assert_eq!(client.call_count(), 0);

        let output = read_json(&dir.path().join("results/run_transformed.json"));
        let records = output.as_array().unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0]["actor"]["account"]["homePage"], "https://customer.percipio.com");
        assert_eq!(records[1]["object"], lookup_entry(2)["xapiobject"]);
        assert_eq!(
            records[2]["object"]["id"],
            "https://xapi.percipio.com/xapi/course/00000000-0000-0000-0000-000000000003"
        );
    }

    #[tokio::test]
    async fn test_local_source_must_exist() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.source = Some(dir.path().join("missing.json"));

        let runner = ReportRunner::new(config, Arc::new(ScriptedHttpClient::new())).unwrap();
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, ReportflowError::Configuration(_)), "{err}");
    }

    #[tokio::test]
    async fn test_missing_lookup_file_fails_before_writing() {
        let dir = TempDir::new().unwrap();
        let source = write_json_file(dir.path(), "report.json", &json!(course_records(1)));
        let mut config = config(&dir);
        config.source = Some(source);
        config.lookup = Some(dir.path().join("nope.json"));

        let runner = ReportRunner::new(config, Arc::new(ScriptedHttpClient::new())).unwrap();
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, ReportflowError::Configuration(_)), "{err}");
        assert!(!dir.path().join("results/run_transformed.json").exists());
    }

    #[tokio::test]
    async fn test_remote_report_is_saved_transformed_and_dispatched() {
        let dir = TempDir::new().unwrap();
        let mut config = remote(config(&dir));
        config.lrs = Some(LrsConfig::basic("https://lrs.example.com/statements", "u", "p"));

        let client = ScriptedHttpClient::new()
            .with_ok(json!({"id": "r-9"}))
            .with_ok(json!({"status": "IN_PROGRESS"}))
            .with_ok(json!(course_records(2)))
            .with_fallback(ScriptedReply::Ok {
                status: 200,
                body: json!(["stored"]),
            });
        let runner = ReportRunner::new(config, Arc::new(client.clone())).unwrap();
        let summary = runner.run().await.unwrap();

        let raw: PathBuf = dir.path().join("results/run.json");
        assert_eq!(
            summary.report,
            Some(ReportOutcome::Saved {
                path: raw.clone(),
                records: Some(2)
            })
        );
        assert_eq!(read_json(&raw), json!(course_records(2)));

        let transformed = summary.transformed.unwrap();
        assert_eq!(transformed.records_processed, 2);
        assert_eq!(client.call_count(), 3 + 2);

        let dispatched = &client.requests()[3];
        assert_eq!(dispatched.url, "https://lrs.example.com/statements");
        assert_eq!(dispatched.header("X-Experience-API-Version"), Some("1.0.0"));

        let output = read_json(&dir.path().join("results/run_transformed.json"));
        assert_eq!(output[0]["httpStatus"], 200);
        assert_eq!(output[0]["remoteResponseBody"], json!(["stored"]));
        assert_eq!(output[1]["statement"]["actor"]["account"]["name"], "user-2");
    }

    #[tokio::test]
    async fn test_remote_empty_report_skips_transform() {
        let dir = TempDir::new().unwrap();
        let config = remote(config(&dir));
        let client = ScriptedHttpClient::new()
            .with_ok(json!({"id": "r-1"}))
            .with_ok(json!([]));

        let runner = ReportRunner::new(config, Arc::new(client)).unwrap();
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.report, Some(ReportOutcome::NoRecords));
        assert!(summary.transformed.is_none());
        assert!(!dir.path().join("results/run.json").exists());
    }

    #[tokio::test]
    async fn test_csv_output_format() {
        let dir = TempDir::new().unwrap();
        let source = write_json_file(dir.path(), "report.json", &json!(course_records(2)));
        let mut config = config(&dir);
        config.source = Some(source);
        config.output_format = OutputFormat::Csv;
        config.transform = Some(write_json_file(
            dir.path(),
            "flat.json",
            &json!({"user": "{{userId}}", "title": "{{contentTitle}}"}),
        ));

        let runner = ReportRunner::new(config, Arc::new(ScriptedHttpClient::new())).unwrap();
        let result = runner.run().await.unwrap().transformed.unwrap();

        let text = std::fs::read_to_string(result.output_path.unwrap()).unwrap();
        assert_eq!(
            text,
            "\"title\",\"user\"\r\n\"Course 1\",\"user-1\"\r\n\"Course 2\",\"user-2\"\r\n"
        );
    }
}
