//! Request templates rendered from configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use super::{HttpMethod, HttpRequest};
use crate::errors::{ReportflowError, Result};

#[allow(clippy::expect_used)]
fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is valid")
    })
}

/// Substitutes `{name}` placeholders in a URI template.
///
/// Every placeholder must have a value; a missing one is a configuration
/// error rather than a silently broken URL.
pub fn render_uri(template: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut missing = Vec::new();
    let rendered = placeholder_pattern().replace_all(template, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        values.get(name).cloned().unwrap_or_else(|| {
            missing.push(name.to_string());
            String::new()
        })
    });

    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(ReportflowError::configuration(format!(
            "URI template '{template}' has no value for: {}",
            missing.join(", ")
        )))
    }
}

fn default_timeout_ms() -> u64 {
    2000
}

/// A templated request as it appears in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestTemplate {
    /// Base URL of the service.
    #[serde(default)]
    pub base_url: String,
    /// Path template with `{name}` placeholders.
    #[serde(default)]
    pub uri_template: String,
    /// Method.
    #[serde(default)]
    pub method: HttpMethod,
    /// Bearer token sent as `Authorization: Bearer <token>`.
    #[serde(default)]
    pub bearer: Option<String>,
    /// Values for the path placeholders.
    #[serde(default)]
    pub path: BTreeMap<String, String>,
    /// Query parameters; null values are omitted.
    #[serde(default)]
    pub query: serde_json::Map<String, serde_json::Value>,
    /// Body fields; null values are omitted and an empty body is not sent.
    #[serde(default)]
    pub body: serde_json::Map<String, serde_json::Value>,
    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl RequestTemplate {
    /// Creates a template.
    #[must_use]
    pub fn new(
        method: HttpMethod,
        base_url: impl Into<String>,
        uri_template: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            uri_template: uri_template.into(),
            method,
            timeout_ms: default_timeout_ms(),
            ..Default::default()
        }
    }

    /// Sets a path value.
    #[must_use]
    pub fn with_path_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.path.insert(key.into(), value.into());
        self
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.bearer = Some(bearer.into());
        self
    }

    /// Sets a body field.
    #[must_use]
    pub fn with_body_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    /// Returns the timeout as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Renders the template into a request.
    pub fn render(&self) -> Result<HttpRequest> {
        let path = render_uri(&self.uri_template, &self.path)?;
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);

        let mut request = HttpRequest::new(self.method, url).with_timeout(self.timeout());

        if let Some(bearer) = self.bearer.as_deref().filter(|b| !b.is_empty()) {
            request = request.with_header("Authorization", format!("Bearer {bearer}"));
        }

        request.query = self
            .query
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect();

        let body: serde_json::Map<String, serde_json::Value> = self
            .body
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !body.is_empty() {
            request.body = Some(serde_json::Value::Object(body));
        }

        Ok(request)
    }
}
