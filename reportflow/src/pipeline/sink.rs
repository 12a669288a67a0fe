//! Record sinks and output encoders.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::Record;
use crate::errors::{ReportflowError, Result};

/// Result of finishing a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOutcome {
    /// Records written.
    pub records_written: u64,
    /// Final artifact path; `None` when nothing was saved.
    pub path: Option<PathBuf>,
    /// Whether an artifact was kept.
    pub saved: bool,
}

/// Receives the records that reach the end of a pipeline.
#[async_trait]
pub trait RecordSink: Send {
    /// Writes one record.
    async fn write(&mut self, record: &Record) -> Result<()>;

    /// Makes the output durable. Called once, after the last write.
    async fn finish(&mut self) -> Result<SinkOutcome>;

    /// Discards everything written so far. Must not fail.
    async fn abort(&mut self);
}

/// Encodes records into an output wire format.
pub trait RecordEncoder: Send {
    /// File extension without the dot.
    fn extension(&self) -> &'static str;

    /// Appends the encoding of one record to `out`.
    fn encode(&mut self, record: &Record, out: &mut Vec<u8>) -> Result<()>;

    /// Appends any closing bytes. Only called when at least one record was
    /// encoded.
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()>;
}

/// Encodes records as the elements of one JSON array.
#[derive(Debug, Clone, Default)]
pub struct JsonArrayEncoder {
    started: bool,
}

impl JsonArrayEncoder {
    /// Creates an encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordEncoder for JsonArrayEncoder {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn encode(&mut self, record: &Record, out: &mut Vec<u8>) -> Result<()> {
        let prefix: &[u8] = if self.started { b"\n,\n" } else { b"[\n" };
        out.extend_from_slice(prefix);
        self.started = true;
        serde_json::to_writer(&mut *out, record)?;
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(b"\n]\n");
        Ok(())
    }
}

/// Encodes object records as CSV rows.
///
/// The header comes from the keys of the first record and fixes the column
/// order; later records fill missing columns with empty fields and ignore
/// extra keys. Every field is quoted and rows end with CRLF. Nested values
/// are written as JSON text.
#[derive(Debug, Default)]
pub struct CsvEncoder {
    columns: Option<Vec<String>>,
}

impl CsvEncoder {
    /// Creates an encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn writer(out: &mut Vec<u8>) -> csv::Writer<&mut Vec<u8>> {
        csv::WriterBuilder::new()
            .has_headers(false)
            .quote_style(csv::QuoteStyle::Always)
            .terminator(csv::Terminator::CRLF)
            .from_writer(out)
    }

    fn field(value: Option<&serde_json::Value>) -> String {
        match value {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

impl RecordEncoder for CsvEncoder {
    fn extension(&self) -> &'static str {
        "csv"
    }

    fn encode(&mut self, record: &Record, out: &mut Vec<u8>) -> Result<()> {
        let object = record.as_object().ok_or_else(|| {
            ReportflowError::Internal(format!(
                "CSV output needs object records, got {}",
                json_kind(record)
            ))
        })?;

        let mut writer = Self::writer(out);
        if self.columns.is_none() {
            let columns: Vec<String> = object.keys().cloned().collect();
            writer.write_record(&columns)?;
            self.columns = Some(columns);
        }
        let columns = self.columns.as_deref().unwrap_or_default();

        writer.write_record(columns.iter().map(|column| Self::field(object.get(column))))?;
        writer.flush()?;
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}

pub(crate) const fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Returns the hidden staging path used while writing `path`.
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// Writes encoded records to a file.
///
/// Output is staged in a hidden `.<name>.tmp` file next to the target and
/// renamed into place once finished. If nothing was written, or the run is
/// aborted, the staging file is removed and no artifact remains.
pub struct FileSink<E> {
    final_path: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    encoder: E,
    scratch: Vec<u8>,
    records_written: u64,
}

impl<E> std::fmt::Debug for FileSink<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("final_path", &self.final_path)
            .field("records_written", &self.records_written)
            .finish_non_exhaustive()
    }
}

impl<E: RecordEncoder> FileSink<E> {
    /// Creates the staging file for `path`.
    pub async fn create(path: impl Into<PathBuf>, encoder: E) -> Result<Self> {
        let final_path = path.into();
        if let Some(parent) = final_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = staging_path(&final_path);
        let file = File::create(&temp_path).await?;
        debug!(
            path = %final_path.display(),
            temp = %temp_path.display(),
            "Opened file sink"
        );

        Ok(Self {
            final_path,
            temp_path,
            writer: Some(BufWriter::new(file)),
            encoder,
            scratch: Vec::new(),
            records_written: 0,
        })
    }

    /// Returns the final artifact path.
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    async fn remove_staging(&mut self) {
        drop(self.writer.take());
        if let Err(err) = tokio::fs::remove_file(&self.temp_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    temp = %self.temp_path.display(),
                    error = %err,
                    "Failed to remove staging file"
                );
            }
        }
    }
}

#[async_trait]
impl<E: RecordEncoder> RecordSink for FileSink<E> {
    async fn write(&mut self, record: &Record) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ReportflowError::Internal("file sink is already finished".to_string()))?;

        self.scratch.clear();
        self.encoder.encode(record, &mut self.scratch)?;
        writer.write_all(&self.scratch).await?;
        self.records_written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<SinkOutcome> {
        if self.records_written == 0 {
            self.remove_staging().await;
            // A stale artifact from an earlier run would be mistaken for this run's output.
            match tokio::fs::remove_file(&self.final_path).await {
                Ok(()) => debug!(path = %self.final_path.display(), "Removed previous artifact"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            info!(path = %self.final_path.display(), "No records written, nothing saved");
            return Ok(SinkOutcome {
                records_written: 0,
                path: None,
                saved: false,
            });
        }

        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| ReportflowError::Internal("file sink is already finished".to_string()))?;

        self.scratch.clear();
        self.encoder.finish(&mut self.scratch)?;
        writer.write_all(&self.scratch).await?;
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        drop(writer);

        tokio::fs::rename(&self.temp_path, &self.final_path).await?;
        info!(
            path = %self.final_path.display(),
            records = self.records_written,
            "Committed output"
        );

        Ok(SinkOutcome {
            records_written: self.records_written,
            path: Some(self.final_path.clone()),
            saved: true,
        })
    }

    async fn abort(&mut self) {
        if self.writer.is_some() {
            warn!(path = %self.final_path.display(), "Discarding partial output");
        }
        self.remove_staging().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn encode_all(encoder: &mut impl RecordEncoder, records: &[Record]) -> String {
        let mut out = Vec::new();
        for record in records {
            encoder.encode(record, &mut out).unwrap();
        }
        encoder.finish(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_json_array_encoder_output_parses() {
        let records = vec![json!({"a": 1}), json!({"a": 2})];
        let text = encode_all(&mut JsonArrayEncoder::new(), &records);
        let parsed: Vec<Record> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_csv_encoder_quotes_and_crlf() {
        let records = vec![
            json!({"name": "Intro, part 1", "score": 9, "tags": ["a"]}),
            json!({"score": 7, "other": true}),
        ];
        let text = encode_all(&mut CsvEncoder::new(), &records);
        assert_eq!(
            text,
            "\"name\",\"score\",\"tags\"\r\n\
             \"Intro, part 1\",\"9\",\"[\"\"a\"\"]\"\r\n\
             \"\",\"7\",\"\"\r\n"
        );
    }

    #[test]
    fn test_csv_encoder_rejects_non_objects() {
        let mut out = Vec::new();
        let err = CsvEncoder::new().encode(&json!([1, 2]), &mut out).unwrap_err();
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_staging_path() {
        assert_eq!(
            staging_path(Path::new("/out/report.json")),
            PathBuf::from("/out/.report.json.tmp")
        );
    }

    #[tokio::test]
    async fn test_file_sink_commits_by_rename() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");

        let mut sink = FileSink::create(&path, JsonArrayEncoder::new()).await.unwrap();
        sink.write(&json!({"a": 1})).await.unwrap();
        let outcome = sink.finish().await.unwrap();

        assert!(outcome.saved);
        assert_eq!(outcome.records_written, 1);
        assert_eq!(outcome.path.as_deref(), Some(path.as_path()));
        assert!(!staging_path(&path).exists());
        let parsed: Vec<Record> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, vec![json!({"a": 1})]);
    }

    #[tokio::test]
    async fn test_file_sink_zero_records_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(&path, "stale").unwrap();

        let mut sink = FileSink::create(&path, CsvEncoder::new()).await.unwrap();
        let outcome = sink.finish().await.unwrap();

        assert!(!outcome.saved);
        assert_eq!(outcome.path, None);
        assert!(!path.exists());
        assert!(!staging_path(&path).exists());
    }

    #[tokio::test]
    async fn test_file_sink_abort_removes_staging() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("out.json");

        let mut sink = FileSink::create(&path, JsonArrayEncoder::new()).await.unwrap();
        sink.write(&json!({"a": 1})).await.unwrap();
        assert!(staging_path(&path).exists());
        sink.abort().await;

        assert!(!staging_path(&path).exists());
        assert!(!path.exists());
    }
}
