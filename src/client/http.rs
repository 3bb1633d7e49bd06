//! HTTP source adapter.
//!
//! Epistemic foundation:
//! - K_i: One GET per key against a URL template with `{key}` substituted
//! - B_i: The source answers with a JSON object (or an array holding one)
//! - I^B: Status codes are mapped onto transient/permanent fetch errors so the
//!   retry policy can decide

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::models::{expand_headers, FetchError, HarvestError, HttpConfig, Record, Result};

/// Fetches one record per key over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    url_template: String,
    timeout: Duration,
}

impl HttpSource {
    /// Create a source from a URL template and extra headers.
    pub fn new(
        url_template: impl Into<String>,
        timeout: Duration,
        headers: &HashMap<String, String>,
    ) -> Result<Self> {
        let url_template = url_template.into();
        if !url_template.contains("{key}") {
            return Err(HarvestError::InvalidInput(format!(
                "URL template '{url_template}' has no {{key}} placeholder"
            )));
        }

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_str(name)
                .map_err(|e| HarvestError::InvalidInput(format!("header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HarvestError::InvalidInput(format!("header value for '{name}': {e}")))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(header_map)
            .build()
            .map_err(|e| HarvestError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url_template,
            timeout,
        })
    }

    /// Create a source from the `[http]` config section.
    ///
    /// `url_override` takes precedence over the configured template.
    pub fn from_config(config: &HttpConfig, url_override: Option<&str>) -> Result<Self> {
        let template = url_override
            .map(str::to_string)
            .or_else(|| config.url_template.clone())
            .ok_or_else(|| {
                HarvestError::InvalidInput("no URL template configured for HTTP source".to_string())
            })?;
        Self::new(
            template,
            Duration::from_secs(config.timeout_secs),
            &expand_headers(&config.headers),
        )
    }

    pub fn url_template(&self) -> &str {
        &self.url_template
    }

    /// URL for one key.
    pub fn url_for(&self, key: &str) -> String {
        self.url_template.replace("{key}", key)
    }

    /// Fetch the record for one key.
    pub async fn fetch(&self, key: &str) -> std::result::Result<Record, FetchError> {
        let url = self.url_for(key);
        debug!(key = %key, url = %url, "GET");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Connection(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, key, body, retry_after));
        }

        let body: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::InvalidResponse(format!("body is not JSON: {e}"))
            }
        })?;
        record_from_body(body, key)
    }
}

/// Seconds from a `retry-after` header. Values that do not fit a
/// `Duration` are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Map a non-success status onto a fetch error.
fn classify_status(
    status: u16,
    key: &str,
    body: String,
    retry_after: Option<Duration>,
) -> FetchError {
    match status {
        429 => FetchError::RateLimited { retry_after },
        404 => FetchError::NotFound(key.to_string()),
        401 | 403 => FetchError::Auth(format!("status {status}")),
        500..=599 => FetchError::Server {
            status,
            message: body,
        },
        _ => FetchError::Validation(format!("status {status}: {body}")),
    }
}

/// Extract a record from a response body.
fn record_from_body(body: Value, key: &str) -> std::result::Result<Record, FetchError> {
    match body {
        Value::Object(record) => Ok(record),
        Value::Array(items) => items
            .into_iter()
            .find_map(|item| match item {
                Value::Object(record) => Some(record),
                _ => None,
            })
            .ok_or_else(|| FetchError::NotFound(key.to_string())),
        other => Err(FetchError::InvalidResponse(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}
