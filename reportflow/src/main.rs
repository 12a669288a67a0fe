//! Runs one report job as configured by `REPORTFLOW_CONFIG` and the
//! environment.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use reportflow::config::ReportflowConfig;
use reportflow::events::LoggingEventSink;
use reportflow::job::ReportOutcome;
use reportflow::observability::init_tracing;
use reportflow::runner::ReportRunner;

const CONFIG_ENV: &str = "REPORTFLOW_CONFIG";
const DEFAULT_CONFIG: &str = "config/default.json";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let mut config = ReportflowConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {config_path}"))?;
    config.apply_process_env();
    config.finalize(chrono::Utc::now());

    init_tracing(&config.logging).context("initialising logging")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        "Start reportflow"
    );

    let runner = ReportRunner::from_config(config)
        .context("invalid configuration")?
        .with_event_sink(Arc::new(LoggingEventSink::debug()));

    match runner.run().await {
        Ok(summary) => {
            match &summary.report {
                Some(ReportOutcome::Saved { path, .. }) => {
                    info!(path = %path.display(), "Report saved");
                }
                Some(ReportOutcome::NoRecords) => info!("Report contained no records"),
                Some(ReportOutcome::NothingSaved) => info!("No results written"),
                None => {}
            }
            if let Some(result) = &summary.transformed {
                info!(
                    records = result.records_processed,
                    saved = result.saved,
                    path = ?result.output_path,
                    "Transform finished"
                );
            }
            info!("End reportflow");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, details = ?err.to_dict(), "Run failed");
            Err(err.into())
        }
    }
}
