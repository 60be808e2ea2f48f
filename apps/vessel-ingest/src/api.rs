use crate::config::Config;
use crate::ingest::FetchWindow;
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}")]
    Status { url: String, status: StatusCode },
    #[error("{url} returned an undecodable body: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected payload from {url}: {detail}")]
    Payload { url: String, detail: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            FetchError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            FetchError::Decode { .. } | FetchError::Payload { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VesselInfo {
    pub imo: String,
    pub active: bool,
}

#[derive(Deserialize)]
struct RawVessel {
    imo: Value,
    #[serde(default)]
    active: Option<bool>,
}

// IMO numbers arrive as strings or numbers.
pub fn parse_fleet(url: &str, payload: Value) -> Result<Vec<VesselInfo>, FetchError> {
    if let Some(detail) = payload.get("detail") {
        return Err(FetchError::Payload {
            url: url.to_string(),
            detail: detail.to_string(),
        });
    }
    let raw: Vec<RawVessel> =
        serde_json::from_value(payload).map_err(|err| FetchError::Payload {
            url: url.to_string(),
            detail: err.to_string(),
        })?;

    let mut vessels = Vec::with_capacity(raw.len());
    for entry in raw {
        let imo = match &entry.imo {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            other => {
                tracing::warn!(imo = %other, "skipping fleet entry without a usable imo");
                continue;
            }
        };
        vessels.push(VesselInfo {
            imo,
            active: entry.active.unwrap_or(true),
        });
    }
    Ok(vessels)
}

#[async_trait]
pub trait FleetSource: Send + Sync {
    async fn fetch_fleet(&self) -> Result<Vec<VesselInfo>, FetchError>;
    async fn fetch_signals(&self, vessel_id: &str) -> Result<Value, FetchError>;
    async fn fetch_timeseries(
        &self,
        vessel_id: &str,
        window: &FetchWindow,
    ) -> Result<Value, FetchError>;
}

#[derive(Clone)]
pub struct HttpFleetSource {
    http: Client,
    base_url: String,
    api_key: String,
    attempts: u32,
    backoff: Duration,
}

impl HttpFleetSource {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("vessel-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            attempts: config.retry_attempts.max(1),
            backoff: config.retry_backoff(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let url = self.url(path);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.get_json_once(&url, query).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    let delay = self.backoff.saturating_mul(1u32 << (attempt - 1).min(16));
                    tracing::debug!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying vessel api request"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_json_once(&self, url: &str, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let response = self
            .http
            .get(url)
            .query(query)
            .header("Authorization", format!("ApiKey {}", self.api_key))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
    }
}

#[async_trait]
impl FleetSource for HttpFleetSource {
    async fn fetch_fleet(&self) -> Result<Vec<VesselInfo>, FetchError> {
        let payload = self.get_json("fleet", &[]).await?;
        parse_fleet(&self.url("fleet"), payload)
    }

    async fn fetch_signals(&self, vessel_id: &str) -> Result<Value, FetchError> {
        self.get_json(&format!("fleet/{vessel_id}/signals"), &[])
            .await
    }

    async fn fetch_timeseries(
        &self,
        vessel_id: &str,
        window: &FetchWindow,
    ) -> Result<Value, FetchError> {
        let query = [
            (
                "from_date",
                window.from.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            (
                "to_date",
                window.to.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ];
        self.get_json(&format!("fleet/{vessel_id}/timeseries"), &query)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn fleet_listing_accepts_string_and_numeric_imo() {
        let payload = json!([
            {"imo": "9123456", "active": true},
            {"imo": 9876543},
            {"imo": "1111111", "active": false},
            {"imo": null}
        ]);
        let vessels = parse_fleet("fleet", payload).unwrap();
        assert_eq!(
            vessels,
            vec![
                VesselInfo { imo: "9123456".to_string(), active: true },
                VesselInfo { imo: "9876543".to_string(), active: true },
                VesselInfo { imo: "1111111".to_string(), active: false },
            ]
        );
    }

    #[test]
    fn fleet_error_detail_is_a_payload_error() {
        let err = parse_fleet("fleet", json!({"detail": "Invalid API key"})).unwrap_err();
        assert!(matches!(err, FetchError::Payload { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_throttling_and_server_errors_are_retryable() {
        let status = |code: u16| FetchError::Status {
            url: "fleet".to_string(),
            status: StatusCode::from_u16(code).unwrap(),
        };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(401).is_retryable());
    }

    #[test]
    fn urls_join_base_and_path_with_one_slash() {
        let mut config = Config::for_tests(PathBuf::from("/tmp/data"));
        config.api_base_url = "https://api.example.com/v1/".to_string();
        let source = HttpFleetSource::new(&config).unwrap();
        assert_eq!(
            source.url("fleet/9123456/signals"),
            "https://api.example.com/v1/fleet/9123456/signals"
        );
    }
}
