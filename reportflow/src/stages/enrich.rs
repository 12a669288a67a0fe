//! Activity lookup enrichment.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{ReportflowError, Result, StageError};
use crate::pipeline::{Emitted, PipelineStage, Record};

const STAGE_NAME: &str = "enrich";
const COURSE_ID_PREFIX: &str = "https://xapi.percipio.com/xapi/course/";
const COURSE_ACTIVITY_TYPE: &str = "http://adlnet.gov/expapi/activities/course";

#[derive(Debug, Deserialize)]
struct LookupEntry {
    #[serde(rename = "contentUuid")]
    content_uuid: Value,
    #[serde(default)]
    xapiobject: Value,
}

/// Maps content identifiers to activity objects.
///
/// Built once before a run and shared read-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupTable {
    entries: HashMap<String, Value>,
}

impl LookupTable {
    /// Creates an empty table; every record gets the fallback object.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a table from `{contentUuid, xapiobject}` entries.
    ///
    /// Entries with a null object are skipped. A later duplicate replaces an
    /// earlier one.
    pub fn from_entries(entries: Vec<Value>) -> Result<Self> {
        let mut table = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let entry: LookupEntry = serde_json::from_value(entry).map_err(|err| {
                ReportflowError::configuration(format!("lookup entry {}: {err}", index + 1))
            })?;
            let Some(key) = content_key(Some(&entry.content_uuid)) else {
                return Err(ReportflowError::configuration(format!(
                    "lookup entry {}: contentUuid is null",
                    index + 1
                )));
            };
            if !entry.xapiobject.is_null() {
                table.insert(key, entry.xapiobject);
            }
        }
        Ok(Self { entries: table })
    }

    /// Loads a lookup file holding a JSON array of entries.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReportflowError::configuration(format!(
                    "lookup file not found: {}",
                    path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let entries: Vec<Value> = serde_json::from_str(&text).map_err(|err| {
            ReportflowError::configuration(format!(
                "lookup file {} is not a JSON array: {err}",
                path.display()
            ))
        })?;

        let table = Self::from_entries(entries)?;
        info!(path = %path.display(), entries = table.len(), "Loaded activity lookup");
        Ok(table)
    }

    /// Returns the object for a content identifier.
    #[must_use]
    pub fn get(&self, content_uuid: &str) -> Option<&Value> {
        self.entries.get(content_uuid)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalises a `contentUuid` value: strings as they are, numbers and other
/// scalars by their JSON text. Null and absent ids have no key.
fn content_key(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(id) => Some(id.clone()),
        other => Some(other.to_string()),
    }
}

/// Builds the activity object used when the lookup has no entry.
///
/// Depends only on the record's `contentUuid`, `contentTitle` and
/// `languageCode` fields, so the same record always yields the same object.
/// A missing language code is keyed as `und`.
#[must_use]
pub fn fallback_object(record: &Map<String, Value>) -> Value {
    let content_uuid = content_key(record.get("contentUuid")).unwrap_or_default();
    let language = record
        .get("languageCode")
        .and_then(Value::as_str)
        .filter(|code| !code.is_empty())
        .unwrap_or("und");
    let title = record.get("contentTitle").cloned().unwrap_or(Value::Null);

    let mut definition = Map::new();
    definition.insert(language.to_string(), title);

    json!({
        "objectType": "Activity",
        "id": format!("{COURSE_ID_PREFIX}{content_uuid}"),
        "definition": definition,
        "type": COURSE_ACTIVITY_TYPE,
    })
}

/// Attaches `xapiobject` and a fresh `xapistatementid` to every record.
#[derive(Debug)]
pub struct EnrichStage {
    lookup: Arc<LookupTable>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EnrichStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(lookup: Arc<LookupTable>) -> Self {
        Self {
            lookup,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns (lookup hits, fallbacks) so far.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl PipelineStage for EnrichStage {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    async fn process(
        &self,
        record: Record,
        ordinal: u64,
    ) -> std::result::Result<Emitted, StageError> {
        let Value::Object(mut fields) = record else {
            return Err(StageError::new(STAGE_NAME, "expected an object record")
                .with_ordinal(ordinal));
        };

        let object = match content_key(fields.get("contentUuid"))
            .and_then(|id| self.lookup.get(&id))
        {
            Some(object) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                object.clone()
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                fallback_object(&fields)
            }
        };

        fields.insert(
            "xapistatementid".to_string(),
            Value::String(Uuid::new_v4().to_string()),
        );
        fields.insert("xapiobject".to_string(), object);
        Ok(Emitted::one(Value::Object(fields)))
    }

    async fn flush(&self) -> std::result::Result<Emitted, StageError> {
        let (hits, misses) = self.stats();
        debug!(hits, fallbacks = misses, "Lookup summary");
        Ok(Emitted::none())
    }
}
