//! Bundled data-source connectors.
//!
//! The engine only depends on the [`DataSource`] trait; these are the
//! batteries shipped next to it. [`RestApiSource`] covers the common case of
//! a JSON statistical API reachable over HTTP GET, and [`StaticSource`]
//! serves canned payloads for fixtures, replays, and tests.

use crate::consilium::prefetch::{DataSource, SourceError, SourceRequest};
use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::Value;
use std::time::Duration;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// One client instance keeps TLS sessions and DNS lookups warm across
    /// all REST sources, which matters when the prefetch stage fans out to
    /// several APIs at once.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// A JSON API reachable over HTTP GET.
///
/// The request question and intent are passed as query parameters
/// (`q`, `intent`) alongside any fixed parameters configured on the source.
/// The prefetch extractor understands either a `facts`/`observations`/`data`
/// record array or a flat metric→value object in the response body.
///
/// # Example
///
/// ```rust,no_run
/// use consilium::consilium::sources::RestApiSource;
///
/// let source = RestApiSource::new("labor_stats", "https://api.example.org/indicators")
///     .with_api_key("secret")
///     .with_param("country", "qa");
/// ```
pub struct RestApiSource {
    id: String,
    endpoint: String,
    api_key: Option<String>,
    params: Vec<(String, String)>,
}

impl RestApiSource {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            api_key: None,
            params: Vec::new(),
        }
    }

    /// Bearer token sent in the `Authorization` header.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Fixed query parameter appended to every request.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl DataSource for RestApiSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, request: &SourceRequest) -> Result<Value, SourceError> {
        let mut query: Vec<(String, String)> = vec![
            ("q".to_string(), request.question.clone()),
            ("intent".to_string(), request.intent.to_string()),
        ];
        query.extend(self.params.iter().cloned());

        let mut builder = SHARED_HTTP_CLIENT.get(&self.endpoint).query(&query);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SourceError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Upstream(format!(
                "HTTP {} from {}",
                status.as_u16(),
                self.endpoint
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| SourceError::BadPayload(e.to_string()))
    }
}

/// In-memory source returning a fixed payload (or a fixed error).
///
/// Deterministic by construction, which makes it the source of choice for
/// integration tests and offline replays of recorded API payloads.
pub struct StaticSource {
    id: String,
    result: Result<Value, String>,
}

impl StaticSource {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            result: Ok(payload),
        }
    }

    /// A source that always fails, for exercising degraded paths.
    pub fn failing(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Err(error.into()),
        }
    }
}

#[async_trait]
impl DataSource for StaticSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, _request: &SourceRequest) -> Result<Value, SourceError> {
        match &self.result {
            Ok(payload) => Ok(payload.clone()),
            Err(message) => Err(SourceError::Upstream(message.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consilium::classifier::Intent;
    use serde_json::json;
    use std::collections::HashMap;

    fn request() -> SourceRequest {
        SourceRequest {
            question: "test".into(),
            intent: Intent::Diagnostic,
            entities: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn static_source_returns_payload() {
        let source = StaticSource::new("fixture", json!({"gdp_growth": 2.4}));
        let payload = source.fetch(&request()).await.unwrap();
        assert_eq!(payload["gdp_growth"], 2.4);
    }

    #[tokio::test]
    async fn failing_source_surfaces_upstream_error() {
        let source = StaticSource::failing("fixture", "HTTP 500");
        let error = source.fetch(&request()).await.unwrap_err();
        assert!(error.to_string().contains("HTTP 500"));
    }
}
