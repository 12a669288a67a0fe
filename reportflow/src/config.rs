//! Run configuration.
//!
//! Built-in defaults, a JSON file and `REPORTFLOW_` environment variables
//! are layered with the `config` crate (objects merge member by member).
//! The short legacy variable names are applied on top by
//! [`apply_env_overrides`], and [`finalize`] fills in the values derived
//! from other values or from the start time.
//!
//! [`apply_env_overrides`]: ReportflowConfig::apply_env_overrides
//!
//! [`finalize`]: ReportflowConfig::finalize

use chrono::{DateTime, Utc};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{ReportflowError, Result};
use crate::http::{HttpMethod, RateLimitConfig, RequestTemplate};
use crate::observability::LoggingConfig;
use crate::retry::RetryConfig;
use crate::stages::LrsConfig;

const REPORT_URI: &str = "/reporting/v1/organizations/{orgId}/report-requests/learning-activity";
const POLL_URI: &str = "/reporting/v1/organizations/{orgId}/report-requests/{reportRequestId}";
const DEFAULT_TIME_FRAME: &str = "THIRTY_DAYS";

/// Path placeholder filled with the submitted report's id.
pub const REPORT_REQUEST_ID: &str = "reportRequestId";
/// Path placeholder for the organization.
pub const ORG_ID: &str = "orgId";

/// Encoding of the transformed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// A JSON array.
    #[default]
    Json,
    /// CSV rows with a header.
    Csv,
}

impl OutputFormat {
    /// Returns the file extension.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

/// Where artifacts are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output directory.
    pub path: PathBuf,
    /// File name without extension; derived from the start time when unset.
    pub filename: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("results"),
            filename: None,
        }
    }
}

impl OutputConfig {
    fn stem(&self) -> Result<&str> {
        self.filename
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ReportflowError::configuration("output.filename is not set"))
    }

    /// Path of the raw report: `<path>/<filename>.<extension>`.
    pub fn report_path(&self, extension: &str) -> Result<PathBuf> {
        Ok(self.path.join(format!("{}.{extension}", self.stem()?)))
    }

    /// Path of the pipeline output: `<path>/<filename>_transformed.<ext>`.
    pub fn transformed_path(&self, format: OutputFormat) -> Result<PathBuf> {
        Ok(self
            .path
            .join(format!("{}_transformed.{}", self.stem()?, format.extension())))
    }
}

/// Pipeline driver settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Progress is reported every this many records per stage.
    pub log_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { log_every: 1000 }
    }
}

fn default_report_request() -> RequestTemplate {
    let mut template = RequestTemplate::new(HttpMethod::Post, "", REPORT_URI);
    let body = json!({
        "start": null,
        "end": null,
        "timeFrame": null,
        "audience": "ALL",
        "status": "COMPLETED",
        "formatType": "JSON",
        "sort": {"field": "lastAccessDate", "order": "desc"},
        "csvPreferences": {"header": true, "rowDelimiter": "\n", "columnDelimiter": ","},
    });
    if let Value::Object(body) = body {
        template.body = body;
    }
    template
}

fn default_poll_request() -> RequestTemplate {
    RequestTemplate::new(HttpMethod::Get, "", POLL_URI)
}

/// Complete configuration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportflowConfig {
    /// A previously retrieved report to re-process instead of calling the service.
    pub source: Option<PathBuf>,
    /// Bound as `$homepage` in the transform.
    pub homepage: String,
    /// Transform template file; no transform runs when unset.
    pub transform: Option<PathBuf>,
    /// Activity lookup file.
    pub lookup: Option<PathBuf>,
    /// Artifact location.
    pub output: OutputConfig,
    /// Encoding of the transformed output.
    pub output_format: OutputFormat,
    /// Learning record store; records are dispatched only when set.
    pub lrs: Option<LrsConfig>,
    /// Report submission request.
    pub report_request: RequestTemplate,
    /// Report poll request.
    pub poll_request: RequestTemplate,
    /// Retry settings shared by every outbound call.
    pub retry: RetryConfig,
    /// Rate limit shared by every outbound call.
    pub rate_limit: RateLimitConfig,
    /// Pipeline driver settings.
    pub pipeline: PipelineConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

impl Default for ReportflowConfig {
    fn default() -> Self {
        Self {
            source: None,
            homepage: "https://customer.percipio.com".to_string(),
            transform: Some(PathBuf::from("transform/default.json")),
            lookup: None,
            output: OutputConfig::default(),
            output_format: OutputFormat::default(),
            lrs: None,
            report_request: default_report_request(),
            poll_request: default_poll_request(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

const ENV_PREFIX: &str = "REPORTFLOW";

fn config_error(err: config::ConfigError) -> ReportflowError {
    ReportflowError::configuration(format!("invalid config: {err}"))
}

impl ReportflowConfig {
    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let defaults = config::Config::try_from(&Self::default()).map_err(config_error)?;
        Ok(config::Config::builder().add_source(defaults))
    }

    /// `REPORTFLOW_<SECTION>__<FIELD>` variables, e.g.
    /// `REPORTFLOW_RATE_LIMIT__MAX_REQUESTS=5`.
    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn assemble(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(config_error)
    }

    /// Parses a JSON document layered over the defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::from_json_with_env(text, HashMap::new())
    }

    /// Parses a JSON document layered over the defaults, with `vars` in the
    /// place of the process environment.
    pub fn from_json_with_env(text: &str, vars: HashMap<String, String>) -> Result<Self> {
        Self::assemble(
            Self::defaults()?
                .add_source(File::from_str(text, FileFormat::Json))
                .add_source(Self::environment().source(Some(vars))),
        )
    }

    /// Loads a JSON config file layered over the defaults, then
    /// `REPORTFLOW_` variables from the process environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::assemble(
            Self::defaults()?
                .add_source(File::from(path).format(FileFormat::Json))
                .add_source(Self::environment()),
        )?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file leaves the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
        }
        Self::assemble(
            Self::defaults()?
                .add_source(File::from(path).format(FileFormat::Json).required(false))
                .add_source(Self::environment()),
        )
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// Unset and empty variables leave the configuration untouched. `BEARER`,
    /// `BASEURL` and `ORGID` apply to both the report and the poll request.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(source) = var("SOURCE") {
            self.source = Some(PathBuf::from(source));
        }
        if let Some(homepage) = var("HOMEPAGE") {
            self.homepage = homepage;
        }
        if let Some(lookup_file) = var("XAPILOOKUP") {
            self.lookup = Some(PathBuf::from(lookup_file));
        }

        let endpoint = var("LRSENDPOINT");
        let username = var("LRSUSERNAME");
        let password = var("LRSPASSWORD");
        if endpoint.is_some() || username.is_some() || password.is_some() {
            let lrs = self.lrs.get_or_insert_with(LrsConfig::default);
            if let Some(endpoint) = endpoint {
                lrs.endpoint = endpoint;
            }
            if username.is_some() {
                lrs.username = username;
            }
            if password.is_some() {
                lrs.password = password;
            }
        }

        for template in [&mut self.report_request, &mut self.poll_request] {
            if let Some(bearer) = var("BEARER") {
                template.bearer = Some(bearer);
            }
            if let Some(base_url) = var("BASEURL") {
                template.base_url = base_url;
            }
            if let Some(org_id) = var("ORGID") {
                template.path.insert(ORG_ID.to_string(), org_id);
            }
        }

        for (name, field) in [("START", "start"), ("END", "end"), ("TIMEFRAME", "timeFrame")] {
            if let Some(value) = var(name) {
                self.report_request
                    .body
                    .insert(field.to_string(), Value::String(value));
            }
        }
    }

    /// Applies overrides from the process environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env_overrides(|name| std::env::var(name).ok());
    }

    /// Fills in derived values.
    ///
    /// The report time frame defaults to thirty days unless an explicit start
    /// is given, the output file name defaults to `<YYYYMMDD_HHMMSS>_results`
    /// from `started_at`, and an LRS without an endpoint is dropped.
    pub fn finalize(&mut self, started_at: DateTime<Utc>) {
        let body = &mut self.report_request.body;
        let has_start = body.get("start").is_some_and(|start| !start.is_null());
        let has_time_frame = body.get("timeFrame").is_some_and(|tf| !tf.is_null());
        if !has_start && !has_time_frame {
            body.insert("timeFrame".to_string(), json!(DEFAULT_TIME_FRAME));
        }

        if self.output.filename.as_deref().map_or(true, str::is_empty) {
            self.output.filename = Some(format!("{}_results", started_at.format("%Y%m%d_%H%M%S")));
        }

        if self.lrs.as_ref().is_some_and(|lrs| lrs.endpoint.is_empty()) {
            debug!("LRS has no endpoint, dispatch disabled");
            self.lrs = None;
        }
    }

    /// Returns true when a local report is re-processed instead of calling
    /// the reporting service.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.source.is_some()
    }

    /// Checks the configuration for the chosen path.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.rate_limit.validate()?;
        if self.pipeline.log_every == 0 {
            return Err(ReportflowError::configuration(
                "pipeline.log_every must be greater than 0",
            ));
        }
        self.output.stem()?;
        if let Some(lrs) = &self.lrs {
            lrs.validate()?;
        }

        if self.is_local() {
            if self.transform.is_none() {
                return Err(ReportflowError::configuration(
                    "a transform is required to re-process a local source",
                ));
            }
            return Ok(());
        }

        let templates = [
            ("report_request", &self.report_request),
            ("poll_request", &self.poll_request),
        ];
        for (name, template) in templates {
            if template.base_url.is_empty() {
                return Err(ReportflowError::configuration(format!("{name}.base_url is required")));
            }
            if template.path.get(ORG_ID).map_or(true, String::is_empty) {
                return Err(ReportflowError::configuration(format!(
                    "{name}.path.orgId is required"
                )));
            }
        }
        self.report_request.render()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn remote_config() -> ReportflowConfig {
        let mut config = ReportflowConfig::default();
        let vars = env(&[
            ("BASEURL", "https://api.example.com"),
            ("ORGID", "org-1"),
            ("BEARER", "t0k"),
        ]);
        config.apply_env_overrides(|name| vars.get(name).cloned());
        config
    }

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 7).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = ReportflowConfig::default();
        assert_eq!(config.homepage, "https://customer.percipio.com");
        assert_eq!(config.output.path, PathBuf::from("results"));
        assert_eq!(config.report_request.method, HttpMethod::Post);
        assert_eq!(config.report_request.timeout_ms, 2000);
        assert_eq!(config.report_request.body["audience"], "ALL");
        assert_eq!(config.poll_request.uri_template, POLL_URI);
        assert_eq!(config.rate_limit, RateLimitConfig::new(1, 2000));
        assert_eq!(config.retry.max_attempts, 21);
        assert_eq!(config.pipeline.log_every, 1000);
        assert!(config.lrs.is_none());
    }

    #[test]
    fn test_file_merges_over_defaults() {
        let config = ReportflowConfig::from_json_str(
            r#"{
                "report_request": {"body": {"status": "ALL"}, "timeout_ms": 5000},
                "output_format": "csv",
                "retry": {"max_attempts": 4}
            }"#,
        )
        .unwrap();

        assert_eq!(config.report_request.body["status"], "ALL");
        assert_eq!(config.report_request.body["formatType"], "JSON");
        assert_eq!(config.report_request.uri_template, REPORT_URI);
        assert_eq!(config.report_request.timeout_ms, 5000);
        assert_eq!(config.output_format, OutputFormat::Csv);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.max_no_response_attempts, 3);
    }

    #[test]
    fn test_invalid_file_is_configuration_error() {
        let err = ReportflowConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, ReportflowError::Configuration(_)));

        let err = ReportflowConfig::from_json_str(r#"{"output_format": "xml"}"#).unwrap_err();
        assert!(matches!(err, ReportflowError::Configuration(_)));
    }

    #[test]
    fn test_load_and_load_or_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"homepage": "https://lms.example.com"}"#).unwrap();

        let config = ReportflowConfig::load(&path).unwrap();
        assert_eq!(config.homepage, "https://lms.example.com");

        let config = ReportflowConfig::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(config.homepage, "https://customer.percipio.com");

        assert!(ReportflowConfig::load(dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_prefixed_env_layers_over_file() {
        let vars = env(&[
            ("REPORTFLOW_RATE_LIMIT__MAX_REQUESTS", "5"),
            ("REPORTFLOW_RETRY__MAX_ATTEMPTS", "7"),
            ("REPORTFLOW_OUTPUT_FORMAT", "csv"),
            ("HOMEPAGE", "https://ignored.example.com"),
        ]);
        let config = ReportflowConfig::from_json_with_env(
            r#"{"rate_limit": {"max_requests": 2}, "retry": {"max_attempts": 4}}"#,
            vars,
        )
        .unwrap();

        assert_eq!(config.rate_limit, RateLimitConfig::new(5, 2000));
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.max_no_response_attempts, 3);
        assert_eq!(config.output_format, OutputFormat::Csv);
        assert_eq!(config.homepage, "https://customer.percipio.com");
    }

    #[test]
    fn test_nested_body_keys_keep_their_case() {
        let config = ReportflowConfig::from_json_str(
            r#"{"report_request": {"body": {"timeFrame": "SEVEN_DAYS"}}}"#,
        )
        .unwrap();
        let body = &config.report_request.body;
        assert_eq!(body["timeFrame"], "SEVEN_DAYS");
        assert_eq!(body["csvPreferences"]["rowDelimiter"], "\n");
        assert!(body["start"].is_null());
        assert_eq!(config.report_request.path.get(ORG_ID), None);
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("SOURCE", "data/report.json"),
            ("XAPILOOKUP", "lookup.json"),
            ("LRSENDPOINT", "https://lrs.example.com/statements"),
            ("LRSUSERNAME", "user"),
            ("LRSPASSWORD", "pass"),
            ("BASEURL", "https://api.example.com"),
            ("ORGID", "org-1"),
            ("BEARER", "t0k"),
            ("START", "2024-01-01T00:00:00Z"),
            ("HOMEPAGE", ""),
        ]);
        let mut config = ReportflowConfig::default();
        config.apply_env_overrides(|name| vars.get(name).cloned());

        assert_eq!(config.source, Some(PathBuf::from("data/report.json")));
        assert_eq!(config.lookup, Some(PathBuf::from("lookup.json")));
        assert_eq!(config.homepage, "https://customer.percipio.com");
        let lrs = config.lrs.as_ref().unwrap();
        assert_eq!(lrs.endpoint, "https://lrs.example.com/statements");
        assert_eq!(lrs.credential().unwrap(), "Basic dXNlcjpwYXNz");
        for template in [&config.report_request, &config.poll_request] {
            assert_eq!(template.base_url, "https://api.example.com");
            assert_eq!(template.bearer.as_deref(), Some("t0k"));
            assert_eq!(template.path[ORG_ID], "org-1");
        }
        assert_eq!(config.report_request.body["start"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_finalize_derives_time_frame_and_filename() {
        let mut config = remote_config();
        config.finalize(started());
        assert_eq!(config.report_request.body["timeFrame"], "THIRTY_DAYS");
        assert_eq!(config.output.filename.as_deref(), Some("20240301_090507_results"));
        assert_eq!(
            config.output.report_path("json").unwrap(),
            PathBuf::from("results/20240301_090507_results.json")
        );
        assert_eq!(
            config.output.transformed_path(OutputFormat::Csv).unwrap(),
            PathBuf::from("results/20240301_090507_results_transformed.csv")
        );
    }

    #[test]
    fn test_finalize_keeps_explicit_start() {
        let mut config = remote_config();
        config
            .report_request
            .body
            .insert("start".to_string(), json!("2024-01-01T00:00:00Z"));
        config.output.filename = Some("fixed".to_string());
        config.finalize(started());

        assert!(config.report_request.body["timeFrame"].is_null());
        assert_eq!(config.output.filename.as_deref(), Some("fixed"));
    }

    #[test]
    fn test_finalize_drops_lrs_without_endpoint() {
        let mut config = remote_config();
        config.lrs = Some(LrsConfig::default());
        config.finalize(started());
        assert!(config.lrs.is_none());
    }

    #[test]
    fn test_validate_remote_requires_service_settings() {
        let mut config = ReportflowConfig::default();
        config.finalize(started());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("report_request.base_url"), "{err}");

        let mut config = remote_config();
        config.finalize(started());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_local_requires_transform() {
        let mut config = ReportflowConfig {
            source: Some(PathBuf::from("report.json")),
            transform: None,
            ..ReportflowConfig::default()
        };
        config.finalize(started());
        assert!(matches!(config.validate(), Err(ReportflowError::Configuration(_))));

        config.transform = Some(PathBuf::from("transform/default.json"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_filename() {
        let config = remote_config();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("output.filename"), "{err}");
    }

    #[test]
    fn test_shipped_config_parses() {
        let shipped = include_str!("../../config/default.json");
        let config = ReportflowConfig::from_json_str(shipped).unwrap();
        assert_eq!(config.transform, Some(PathBuf::from("transform/default.json")));
        assert_eq!(config.report_request.uri_template, REPORT_URI);
        assert_eq!(config.retry.max_attempts, 21);
        assert_eq!(config.logging, LoggingConfig::default());
    }
}
