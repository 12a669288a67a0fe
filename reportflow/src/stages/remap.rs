//! Record reshaping through a pluggable mapping expression.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::errors::{ReportflowError, Result, StageError};
use crate::pipeline::{Emitted, PipelineStage, Record};

const STAGE_NAME: &str = "remap";

/// Named values available to every evaluation, fixed for the whole run.
pub type Bindings = Map<String, Value>;

/// Error raised by a mapping expression.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MappingError(pub String);

/// What an expression produced for one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Mapped {
    /// The record is dropped.
    None,
    /// One output record.
    One(Record),
    /// Several output records, in order.
    Many(Vec<Record>),
}

impl Mapped {
    /// Interprets a plain value: an array is many records, null is none,
    /// anything else is one.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::None,
            Value::Array(records) => Self::Many(records),
            other => Self::One(other),
        }
    }
}

impl From<Mapped> for Emitted {
    fn from(mapped: Mapped) -> Self {
        match mapped {
            Mapped::None => Self::none(),
            Mapped::One(record) => Self::one(record),
            Mapped::Many(records) => Self::many(records),
        }
    }
}

/// Evaluates against one record and the run's bindings.
pub trait MappingExpression: Send + Sync + std::fmt::Debug {
    /// Maps a record.
    fn evaluate(
        &self,
        record: &Record,
        bindings: &Bindings,
    ) -> std::result::Result<Mapped, MappingError>;
}

/// A mapping expression backed by a closure.
pub struct FnExpression<F> {
    name: String,
    func: F,
}

impl<F> FnExpression<F>
where
    F: Fn(&Record, &Bindings) -> std::result::Result<Mapped, MappingError> + Send + Sync,
{
    /// Creates a named closure expression.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> std::fmt::Debug for FnExpression<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExpression")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<F> MappingExpression for FnExpression<F>
where
    F: Fn(&Record, &Bindings) -> std::result::Result<Mapped, MappingError> + Send + Sync,
{
    fn evaluate(
        &self,
        record: &Record,
        bindings: &Bindings,
    ) -> std::result::Result<Mapped, MappingError> {
        (self.func)(record, bindings)
    }
}

#[allow(clippy::expect_used)]
fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*(\$?[A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}")
            .expect("template pattern is valid")
    })
}

/// A JSON document with `{{field.path}}` and `{{$binding}}` placeholders.
///
/// A string that is exactly one placeholder is replaced by the referenced
/// value with its type intact; an object member whose placeholder resolves
/// to nothing is left out. Placeholders inside longer strings are
/// interpolated as text. Array indexes are written as path segments
/// (`items.0.id`).
///
/// The rendered document is read with [`Mapped::from_value`], so a template
/// that renders to an array expands the record.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateExpression {
    template: Value,
}

impl TemplateExpression {
    /// Creates an expression from a template value.
    #[must_use]
    pub fn new(template: Value) -> Self {
        Self { template }
    }

    /// Loads a template file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReportflowError::configuration(format!(
                    "transform file not found: {}",
                    path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let template = serde_json::from_str(&text).map_err(|err| {
            ReportflowError::configuration(format!(
                "transform file {} is not valid JSON: {err}",
                path.display()
            ))
        })?;
        Ok(Self::new(template))
    }

    fn resolve<'a>(
        reference: &str,
        record: &'a Record,
        bindings: &'a Bindings,
    ) -> Option<&'a Value> {
        if let Some(name) = reference.strip_prefix('$') {
            return bindings.get(name);
        }
        reference.split('.').try_fold(record, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    fn render(&self, node: &Value, record: &Record, bindings: &Bindings) -> Option<Value> {
        match node {
            Value::String(text) => Self::render_string(text, record, bindings),
            Value::Array(items) => Some(Value::Array(
                items
                    .iter()
                    .filter_map(|item| self.render(item, record, bindings))
                    .collect(),
            )),
            Value::Object(members) => Some(Value::Object(
                members
                    .iter()
                    .filter_map(|(key, value)| {
                        self.render(value, record, bindings).map(|v| (key.clone(), v))
                    })
                    .collect(),
            )),
            other => Some(other.clone()),
        }
    }

    fn render_string(text: &str, record: &Record, bindings: &Bindings) -> Option<Value> {
        let pattern = placeholder_pattern();

        if let Some(caps) = pattern.captures(text) {
            if caps.get(0).map(|m| m.as_str().len()) == Some(text.len()) {
                return Self::resolve(&caps[1], record, bindings).cloned();
            }
        } else {
            return Some(Value::String(text.to_string()));
        }

        let rendered = pattern.replace_all(text, |caps: &regex::Captures<'_>| {
            match Self::resolve(&caps[1], record, bindings) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            }
        });
        Some(Value::String(rendered.into_owned()))
    }
}

impl MappingExpression for TemplateExpression {
    fn evaluate(
        &self,
        record: &Record,
        bindings: &Bindings,
    ) -> std::result::Result<Mapped, MappingError> {
        let rendered = self.render(&self.template, record, bindings).unwrap_or(Value::Null);
        Ok(Mapped::from_value(rendered))
    }
}

/// Applies a mapping expression to every record.
#[derive(Debug)]
pub struct RemapStage {
    expression: Arc<dyn MappingExpression>,
    bindings: Bindings,
}

impl RemapStage {
    /// Creates the stage. `bindings` are fixed for the whole run.
    #[must_use]
    pub fn new(expression: Arc<dyn MappingExpression>, bindings: Bindings) -> Self {
        Self {
            expression,
            bindings,
        }
    }
}

#[async_trait]
impl PipelineStage for RemapStage {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    async fn process(
        &self,
        record: Record,
        ordinal: u64,
    ) -> std::result::Result<Emitted, StageError> {
        let mapped = self
            .expression
            .evaluate(&record, &self.bindings)
            .map_err(|err| StageError::from_error(STAGE_NAME, err).with_ordinal(ordinal))?;
        Ok(mapped.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{course_record, write_json_file};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn bindings() -> Bindings {
        let mut bindings = Bindings::new();
        bindings.insert("homepage".to_string(), json!("https://lms.example.com"));
        bindings
    }

    #[test]
    fn test_mapped_from_value() {
        assert_eq!(Mapped::from_value(Value::Null), Mapped::None);
        assert_eq!(Mapped::from_value(json!({"a": 1})), Mapped::One(json!({"a": 1})));
        assert_eq!(
            Mapped::from_value(json!([1, 2])),
            Mapped::Many(vec![json!(1), json!(2)])
        );
    }

    #[test]
    fn test_template_renders_paths_and_bindings() {
        let expression = TemplateExpression::new(json!({
            "actor": {
                "name": "{{firstName}} {{lastName}}",
                "account": {"homePage": "{{$homepage}}", "name": "{{userId}}"},
            },
            "object": "{{xapiobject}}",
            "missing": "{{noSuchField}}",
            "version": "1.0.0",
            "score": 3,
        }));
        let mut record = course_record(1);
        record["xapiobject"] = json!({"id": "urn:x"});

        let mapped = expression.evaluate(&record, &bindings()).unwrap();
        assert_eq!(
            mapped,
            Mapped::One(json!({
                "actor": {
                    "name": "Ada Lovelace",
                    "account": {"homePage": "https://lms.example.com", "name": "user-1"},
                },
                "object": {"id": "urn:x"},
                "version": "1.0.0",
                "score": 3,
            }))
        );
    }

    #[test]
    fn test_template_array_index_path() {
        let expression = TemplateExpression::new(json!("{{items.1.id}}"));
        let record = json!({"items": [{"id": "a"}, {"id": "b"}]});
        assert_eq!(
            expression.evaluate(&record, &Bindings::new()).unwrap(),
            Mapped::One(json!("b"))
        );
    }

    #[test]
    fn test_template_array_expands() {
        let expression = TemplateExpression::new(json!([
            {"verb": "attempted", "id": "{{userId}}"},
            {"verb": "completed", "id": "{{userId}}"},
        ]));
        let mapped = expression.evaluate(&course_record(2), &Bindings::new()).unwrap();
        assert_eq!(
            mapped,
            Mapped::Many(vec![
                json!({"verb": "attempted", "id": "user-2"}),
                json!({"verb": "completed", "id": "user-2"}),
            ])
        );
    }

    #[test]
    fn test_template_missing_top_level_drops() {
        let expression = TemplateExpression::new(json!("{{nothing}}"));
        assert_eq!(
            expression.evaluate(&json!({}), &Bindings::new()).unwrap(),
            Mapped::None
        );
    }

    #[tokio::test]
    async fn test_template_from_file() {
        let dir = TempDir::new().unwrap();
        let path = write_json_file(dir.path(), "t.json", &json!({"id": "{{userId}}"}));
        let expression = TemplateExpression::from_file(&path).await.unwrap();
        assert_eq!(
            expression.evaluate(&course_record(5), &Bindings::new()).unwrap(),
            Mapped::One(json!({"id": "user-5"}))
        );

        let err = TemplateExpression::from_file(dir.path().join("missing.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReportflowError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_remap_stage_uses_fixed_bindings() {
        let expression = FnExpression::new("homepage", |_record: &Record, bindings: &Bindings| {
            Ok(Mapped::One(json!({"home": bindings["homepage"].clone()})))
        });
        let stage = RemapStage::new(Arc::new(expression), bindings());

        let first = stage.process(json!({}), 1).await.unwrap().into_records();
        let second = stage.process(json!({}), 2).await.unwrap().into_records();
        assert_eq!(first, second);
        assert_eq!(first[0]["home"], "https://lms.example.com");
    }

    #[tokio::test]
    async fn test_remap_stage_error_carries_ordinal() {
        let expression = FnExpression::new("fails", |_: &Record, _: &Bindings| {
            Err(MappingError("undefined function".to_string()))
        });
        let stage = RemapStage::new(Arc::new(expression), Bindings::new());

        let err = stage.process(json!({}), 9).await.unwrap_err();
        assert_eq!(err.to_string(), "Stage 'remap' failed at record 9: undefined function");
    }

    #[test]
    fn test_shipped_statement_template() {
        let template: Value =
            serde_json::from_str(include_str!("../../../transform/default.json")).unwrap();
        let mut record = course_record(3);
        record["xapistatementid"] = json!("6f1c0b7e-0000-4000-8000-000000000003");
        record["xapiobject"] = json!({"id": "urn:course:3"});

        let Mapped::One(statement) = TemplateExpression::new(template)
            .evaluate(&record, &bindings())
            .unwrap()
        else {
            panic!("expected one statement");
        };
        assert_eq!(statement["id"], "6f1c0b7e-0000-4000-8000-000000000003");
        assert_eq!(statement["actor"]["mbox"], "mailto:user3@example.com");
        assert_eq!(statement["actor"]["account"]["homePage"], "https://lms.example.com");
        assert_eq!(statement["object"], json!({"id": "urn:course:3"}));
        assert_eq!(statement["result"], json!({"completion": true}));
        assert_eq!(statement["timestamp"], "2024-03-01T10:00:00Z");
    }
}
