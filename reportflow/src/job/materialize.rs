//! Writing a retrieved report to disk.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::ReportPayload;
use crate::config::OutputConfig;
use crate::errors::Result;
use crate::pipeline::{json_kind, staging_path};

/// What [`materialize`] did with a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The report was written.
    Saved {
        /// Where.
        path: PathBuf,
        /// Number of records, when the report is a JSON array.
        records: Option<usize>,
    },
    /// The report was empty; no artifact exists.
    NoRecords,
    /// The payload could not be saved; nothing was written.
    NothingSaved,
}

impl ReportOutcome {
    /// Returns the artifact path when one was written.
    #[must_use]
    pub fn saved_path(&self) -> Option<&Path> {
        match self {
            Self::Saved { path, .. } => Some(path),
            Self::NoRecords | Self::NothingSaved => None,
        }
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = staging_path(path);
    let mut file = tokio::fs::File::create(&temp_path).await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err.into());
    }
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn remove_stale(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Saves a report payload as `<name>.json` or `<name>.csv`.
///
/// JSON is written pretty-printed, text as is. An empty array or empty text
/// leaves no artifact and reports [`ReportOutcome::NoRecords`]; a payload
/// that is neither reports [`ReportOutcome::NothingSaved`] and is not an
/// error.
pub async fn materialize(payload: ReportPayload, output: &OutputConfig) -> Result<ReportOutcome> {
    match payload {
        ReportPayload::Json(value) => {
            let path = output.report_path("json")?;
            let records = value.as_array().map(Vec::len);
            if records == Some(0) {
                remove_stale(&path).await?;
                info!(path = %path.display(), "No records downloaded");
                return Ok(ReportOutcome::NoRecords);
            }

            let mut bytes = serde_json::to_vec_pretty(&value)?;
            bytes.push(b'\n');
            write_atomically(&path, &bytes).await?;
            info!(path = %path.display(), records = ?records, "Records saved");
            Ok(ReportOutcome::Saved { path, records })
        }
        ReportPayload::Text(text) => {
            let path = output.report_path("csv")?;
            if text.is_empty() {
                remove_stale(&path).await?;
                info!(path = %path.display(), "No records downloaded");
                return Ok(ReportOutcome::NoRecords);
            }

            write_atomically(&path, text.as_bytes()).await?;
            info!(path = %path.display(), bytes = text.len(), "Records saved");
            Ok(ReportOutcome::Saved {
                path,
                records: None,
            })
        }
        ReportPayload::Unsupported(value) => {
            warn!(
                kind = json_kind(&value),
                "Response is not valid JSON or CSV, no results file created"
            );
            Ok(ReportOutcome::NothingSaved)
        }
    }
}
