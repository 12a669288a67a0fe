//! Production HTTP client backed by reqwest.

use async_trait::async_trait;

use super::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, NoResponseKind};
use crate::errors::{ReportflowError, Result};

/// HTTP client backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Creates a client with a reportflow user agent.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("reportflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReportflowError::configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn classify(request: &HttpRequest, err: &reqwest::Error) -> HttpError {
        let kind = if err.is_timeout() {
            NoResponseKind::Timeout
        } else if err.is_connect() {
            NoResponseKind::Connect
        } else if err.is_request() || err.is_body() {
            NoResponseKind::Reset
        } else {
            NoResponseKind::Other
        };
        HttpError::no_response(request, kind, err.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::classify(request, &e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Self::classify(request, &e))?;
        let body = HttpResponse::decode_body(text);

        if status.is_success() {
            Ok(HttpResponse::new(status.as_u16(), body))
        } else {
            Err(HttpError::status_error(request, status.as_u16(), body))
        }
    }
}
