//! Generic HTTP JSON source.
//!
//! Issues one blocking GET per fetch against a URL template and reads a JSON
//! array of objects, optionally nested under a dotted `records_path`. Retries
//! are the orchestrator's job; this client only classifies failures and keeps
//! the circuit breaker informed.

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::circuit_breaker::CircuitBreaker;
use super::source::{DateRange, FetchError, SourceClient};
use crate::domain::{FieldValue, RawRecord};

/// Connection settings for an HTTP JSON provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpJsonConfig {
    /// e.g. `https://api.example.com/series/{entity}?from={start}&to={end}`
    pub url_template: String,
    /// Dotted path to the record array, e.g. `data.observations`.
    #[serde(default)]
    pub records_path: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Query parameter for the key when the template has no `{api_key}`.
    #[serde(default = "default_api_key_param")]
    pub api_key_param: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    /// Stamp the requested entity id into each record under this field when
    /// the payload leaves it out (FRED observations carry no series id).
    #[serde(default)]
    pub entity_field: Option<String>,
}

/// Characters left as-is when an entity id is placed in a URL.
const ENTITY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn default_api_key_param() -> String {
    "api_key".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl HttpJsonConfig {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            records_path: None,
            api_key_env: None,
            api_key_param: default_api_key_param(),
            timeout_secs: default_timeout_secs(),
            requests_per_minute: None,
            entity_field: None,
        }
    }
}

pub struct HttpJsonSource {
    name: String,
    config: HttpJsonConfig,
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl HttpJsonSource {
    pub fn new(
        name: impl Into<String>,
        config: HttpJsonConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("fincollect/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            config,
            client,
            circuit_breaker,
        })
    }

    fn api_key(&self) -> Result<Option<String>, FetchError> {
        match &self.config.api_key_env {
            None => Ok(None),
            Some(var) => std::env::var(var).map(Some).map_err(|_| {
                FetchError::AuthenticationRequired(format!("environment variable {var} is not set"))
            }),
        }
    }

    /// Expand the URL template for one request. The entity id is percent-encoded.
    pub fn render_url(
        &self,
        entity_id: &str,
        range: &DateRange,
        api_key: Option<&str>,
    ) -> String {
        let entity = utf8_percent_encode(entity_id, ENTITY_ENCODE).to_string();
        let mut url = self
            .config
            .url_template
            .replace("{entity}", &entity)
            .replace("{start}", &range.start.format("%Y-%m-%d").to_string())
            .replace("{end}", &range.end.format("%Y-%m-%d").to_string());
        if let Some(key) = api_key {
            if url.contains("{api_key}") {
                url = url.replace("{api_key}", key);
            } else {
                let sep = if url.contains('?') { '&' } else { '?' };
                url = format!("{url}{sep}{}={key}", self.config.api_key_param);
            }
        }
        url
    }
}

impl SourceClient for HttpJsonSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, entity_id: &str, range: &DateRange) -> Result<Vec<RawRecord>, FetchError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }

        let api_key = self.api_key()?;
        let url = self.render_url(entity_id, range, api_key.as_deref());
        debug!(source = %self.name, entity = entity_id, "GET");

        let resp = self.client.get(&url).send().map_err(|e| {
            self.circuit_breaker.record_failure(entity_id);
            if e.is_timeout() {
                FetchError::Timeout(e.to_string())
            } else {
                FetchError::NetworkUnreachable(e.to_string())
            }
        })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(err) = status_error(status, retry_after, entity_id) {
            match &err {
                FetchError::CircuitBreakerTripped => self.circuit_breaker.trip(),
                e if e.is_transient() => self.circuit_breaker.record_failure(entity_id),
                _ => {}
            }
            return Err(err);
        }

        let body: serde_json::Value = resp.json().map_err(|e| {
            FetchError::ResponseFormatChanged(format!("failed to parse response for {entity_id}: {e}"))
        })?;
        let mut records = records_from_json(
            &self.name,
            &body,
            self.config.records_path.as_deref(),
            Utc::now(),
        )?;
        self.circuit_breaker.record_success();
        if let Some(field) = &self.config.entity_field {
            stamp_entity(&mut records, field, entity_id);
        }

        if records.is_empty() {
            return Err(FetchError::NoData {
                entity: entity_id.to_string(),
            });
        }
        Ok(records)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }

    fn requests_per_minute(&self) -> Option<u32> {
        self.config.requests_per_minute
    }
}

/// Map a non-success status to a fetch error. `None` for success.
///
/// 403 is treated as a ban and reported as a tripped breaker.
pub fn status_error(
    status: StatusCode,
    retry_after_secs: Option<u64>,
    entity_id: &str,
) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::FORBIDDEN => FetchError::CircuitBreakerTripped,
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
            retry_after_secs: retry_after_secs.unwrap_or(60),
        },
        StatusCode::UNAUTHORIZED => {
            FetchError::AuthenticationRequired(format!("provider rejected credentials for {entity_id}"))
        }
        StatusCode::NOT_FOUND => FetchError::EntityNotFound {
            entity: entity_id.to_string(),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            FetchError::Timeout(format!("HTTP {status} for {entity_id}"))
        }
        s if s.is_server_error() => FetchError::ServerError {
            status: s.as_u16(),
            message: format!("HTTP {s} for {entity_id}"),
        },
        s => FetchError::Other(format!("HTTP {s} for {entity_id}")),
    })
}

fn stamp_entity(records: &mut [RawRecord], field: &str, entity_id: &str) {
    for record in records {
        let present = record.get(field).is_some_and(|v| !v.is_null());
        if !present {
            record
                .fields
                .insert(field.to_string(), FieldValue::Text(entity_id.to_string()));
        }
    }
}

/// Extract raw records from a JSON body.
pub fn records_from_json(
    source: &str,
    body: &serde_json::Value,
    records_path: Option<&str>,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawRecord>, FetchError> {
    let mut node = body;
    if let Some(path) = records_path {
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            node = node.get(segment).ok_or_else(|| {
                FetchError::ResponseFormatChanged(format!("missing '{segment}' in records path '{path}'"))
            })?;
        }
    }

    let rows = node
        .as_array()
        .ok_or_else(|| FetchError::ResponseFormatChanged("expected a JSON array of records".into()))?;

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let object = row.as_object().ok_or_else(|| {
                FetchError::ResponseFormatChanged(format!("record {i} is not an object"))
            })?;
            let mut record = RawRecord::new(source, fetched_at);
            for (key, value) in object {
                record.fields.insert(key.clone(), FieldValue::from_json(value));
            }
            Ok(record)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn source(template: &str) -> HttpJsonSource {
        HttpJsonSource::new(
            "test_http",
            HttpJsonConfig::new(template),
            Arc::new(CircuitBreaker::new("test_http", Duration::from_secs(60), 3)),
        )
        .unwrap()
    }

    fn range() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        )
    }

    #[test]
    fn renders_url_template() {
        let s = source("https://api.test/{entity}?from={start}&to={end}");
        assert_eq!(
            s.render_url("UNRATE", &range(), Some("k")),
            "https://api.test/UNRATE?from=2024-01-01&to=2024-02-01&api_key=k"
        );
        let s = source("https://api.test/{entity}/{api_key}");
        assert_eq!(s.render_url("GDP", &range(), Some("k")), "https://api.test/GDP/k");
    }

    #[test]
    fn entity_ids_are_percent_encoded() {
        let s = source("https://api.test/chart/{entity}?from={start}");
        assert_eq!(
            s.render_url("^AXJO", &range(), None),
            "https://api.test/chart/%5EAXJO?from=2024-01-01"
        );
        assert_eq!(
            s.render_url("BHP.AX", &range(), None),
            "https://api.test/chart/BHP.AX?from=2024-01-01"
        );
        assert_eq!(
            s.render_url("A B/C", &range(), None),
            "https://api.test/chart/A%20B%2FC?from=2024-01-01"
        );
    }

    #[test]
    fn status_classification() {
        assert_eq!(status_error(StatusCode::OK, None, "X"), None);
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, None, "X"),
            Some(FetchError::CircuitBreakerTripped)
        );
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, Some(5), "X"),
            Some(FetchError::RateLimited { retry_after_secs: 5 })
        );
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, None, "X"),
            Some(FetchError::AuthenticationRequired(_))
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, None, "X"),
            Some(FetchError::EntityNotFound { .. })
        ));
        let server = status_error(StatusCode::SERVICE_UNAVAILABLE, None, "X").unwrap();
        assert!(server.is_transient());
    }

    #[test]
    fn extracts_nested_records() {
        let body = json!({
            "data": {"observations": [
                {"date": "2024-01-01", "value": "3.9"},
                {"date": "2024-02-01", "value": "."}
            ]}
        });
        let records =
            records_from_json("fred", &body, Some("data.observations"), Utc::now()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("value"), Some(&FieldValue::Text("3.9".into())));
        assert_eq!(records[0].source(), "fred");
    }

    #[test]
    fn entity_is_stamped_only_when_missing() {
        let body = json!([
            {"date": "2024-01-01", "value": "3.9"},
            {"date": "2024-02-01", "value": "3.8", "series_id": "OTHER"}
        ]);
        let mut records = records_from_json("fred", &body, None, Utc::now()).unwrap();
        stamp_entity(&mut records, "series_id", "UNRATE");
        assert_eq!(records[0].get("series_id"), Some(&FieldValue::Text("UNRATE".into())));
        assert_eq!(records[1].get("series_id"), Some(&FieldValue::Text("OTHER".into())));
    }

    #[test]
    fn malformed_bodies_are_format_changes() {
        let body = json!({"data": [1, 2]});
        assert!(matches!(
            records_from_json("x", &body, Some("data"), Utc::now()),
            Err(FetchError::ResponseFormatChanged(_))
        ));
        assert!(matches!(
            records_from_json("x", &body, Some("missing"), Utc::now()),
            Err(FetchError::ResponseFormatChanged(_))
        ));
    }

    #[test]
    fn missing_api_key_is_an_auth_error() {
        let mut config = HttpJsonConfig::new("http://127.0.0.1:9/{entity}");
        config.api_key_env = Some("FINCOLLECT_TEST_KEY_THAT_IS_NOT_SET".into());
        let s = HttpJsonSource::new(
            "keyed",
            config,
            Arc::new(CircuitBreaker::default_provider("keyed")),
        )
        .unwrap();
        assert!(matches!(
            s.fetch("X", &range()),
            Err(FetchError::AuthenticationRequired(_))
        ));
    }

    #[test]
    fn refused_connection_is_transient() {
        let s = source("http://127.0.0.1:9/{entity}");
        let err = s.fetch("X", &range()).unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }

    #[test]
    fn tripped_breaker_refuses_requests() {
        let breaker = Arc::new(CircuitBreaker::new("b", Duration::from_secs(60), 3));
        breaker.trip();
        let s = HttpJsonSource::new("b", HttpJsonConfig::new("http://127.0.0.1:9/"), breaker).unwrap();
        assert!(!s.is_available());
        assert_eq!(s.fetch("X", &range()).unwrap_err(), FetchError::CircuitBreakerTripped);
    }
}
