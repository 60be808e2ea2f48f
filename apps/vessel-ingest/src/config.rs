use crate::pipeline::RunMode;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_BASE_URL: &str = "https://api.hoppe-sts.com/";
const DEFAULT_DATA_DIR: &str = "./data";

fn setup_config_path() -> Option<PathBuf> {
    env::var("FLEET_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    api_base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    data_dir: Option<String>,
    #[serde(default)]
    max_workers: Option<usize>,
    #[serde(default)]
    retry_attempts: Option<u32>,
    #[serde(default)]
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    days_to_keep: Option<u32>,
    #[serde(default)]
    history_days: Option<u32>,
    #[serde(default)]
    lookback_hours: Option<u64>,
    #[serde(default)]
    sample_interval_secs: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "setup config not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "vessel-ingest failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "vessel-ingest failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if env_allows("FLEET_API_BASE_URL") {
        if let Some(url) = non_empty(&overrides.api_base_url) {
            config.api_base_url = url;
        }
    }
    if env_allows("FLEET_API_KEY") {
        if let Some(key) = non_empty(&overrides.api_key) {
            config.api_key = key;
        }
    }
    if env_allows("FLEET_DATA_DIR") {
        if let Some(dir) = non_empty(&overrides.data_dir) {
            config.data_dir = PathBuf::from(dir);
        }
    }
    if env_allows("FLEET_MAX_WORKERS") {
        if let Some(value) = overrides.max_workers.filter(|v| *v != 0) {
            config.max_workers = value;
        }
    }
    if env_allows("FLEET_RETRY_ATTEMPTS") {
        if let Some(value) = overrides.retry_attempts.filter(|v| *v != 0) {
            config.retry_attempts = value;
        }
    }
    if env_allows("FLEET_REQUEST_TIMEOUT_SECS") {
        if let Some(value) = overrides.request_timeout_secs.filter(|v| *v != 0) {
            config.request_timeout_secs = value;
        }
    }
    if env_allows("FLEET_DAYS_TO_KEEP") {
        if let Some(value) = overrides.days_to_keep.filter(|v| *v != 0) {
            config.days_to_keep = value;
        }
    }
    if env_allows("FLEET_HISTORY_DAYS") {
        if let Some(value) = overrides.history_days {
            config.history_days = value;
        }
    }
    if env_allows("FLEET_LOOKBACK_HOURS") {
        if let Some(value) = overrides.lookback_hours.filter(|v| *v != 0) {
            config.lookback_hours = value;
        }
    }
    if env_allows("FLEET_SAMPLE_INTERVAL_SECS") {
        if let Some(value) = overrides.sample_interval_secs.filter(|v| *v != 0) {
            config.sample_interval_secs = value;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,
    pub api_key: String,
    pub data_dir: PathBuf,
    pub max_workers: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub vessel_timeout_secs: u64,
    pub days_to_keep: u32,
    pub history_days: u32,
    pub lookback_hours: u64,
    pub refetch_overlap_minutes: u64,
    pub page_span_hours: u64,
    pub sample_interval_secs: u64,
    pub run_mode: RunMode,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let api_base_url =
            env::var("FLEET_API_BASE_URL").unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string());
        let api_key = env::var("FLEET_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        let data_dir = env::var("FLEET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        let max_workers = env_parse::<usize>("FLEET_MAX_WORKERS").unwrap_or(8);
        let retry_attempts = env_parse::<u32>("FLEET_RETRY_ATTEMPTS").unwrap_or(5);
        let retry_backoff_ms = env_parse::<u64>("FLEET_RETRY_BACKOFF_MS").unwrap_or(1000);
        let request_timeout_secs = env_parse::<u64>("FLEET_REQUEST_TIMEOUT_SECS").unwrap_or(45);
        let vessel_timeout_secs = env_parse::<u64>("FLEET_VESSEL_TIMEOUT_SECS").unwrap_or(300);
        let days_to_keep = env_parse::<u32>("FLEET_DAYS_TO_KEEP").unwrap_or(90);
        let history_days = env_parse::<u32>("FLEET_HISTORY_DAYS").unwrap_or(5);
        let lookback_hours = env_parse::<u64>("FLEET_LOOKBACK_HOURS").unwrap_or(24);
        let refetch_overlap_minutes =
            env_parse::<u64>("FLEET_REFETCH_OVERLAP_MINUTES").unwrap_or(60);
        let page_span_hours = env_parse::<u64>("FLEET_PAGE_SPAN_HOURS").unwrap_or(24);
        let sample_interval_secs = env_parse::<u64>("FLEET_SAMPLE_INTERVAL_SECS").unwrap_or(300);
        let run_mode = match env::var("FLEET_RUN_MODE") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .parse::<RunMode>()
                .with_context(|| format!("invalid FLEET_RUN_MODE {raw:?}"))?,
            _ => RunMode::All,
        };
        let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let mut config = Self {
            api_base_url,
            api_key,
            data_dir,
            max_workers,
            retry_attempts,
            retry_backoff_ms,
            request_timeout_secs,
            vessel_timeout_secs,
            days_to_keep,
            history_days,
            lookback_hours,
            refetch_overlap_minutes,
            page_span_hours,
            sample_interval_secs,
            run_mode,
            otlp_endpoint,
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, |key| !env_is_set(key));
        }

        if config.api_key.is_empty() {
            anyhow::bail!(
                "FLEET_API_KEY is required (or present as api_key in the setup config)"
            );
        }
        config.clamp();

        Ok(config)
    }

    fn clamp(&mut self) {
        self.max_workers = self.max_workers.max(1);
        self.retry_attempts = self.retry_attempts.max(1);
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self.vessel_timeout_secs = self.vessel_timeout_secs.max(1);
        self.days_to_keep = self.days_to_keep.max(1);
        self.lookback_hours = self.lookback_hours.max(1);
        self.page_span_hours = self.page_span_hours.max(1);
        self.sample_interval_secs = self.sample_interval_secs.max(1);
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn vessel_timeout(&self) -> Duration {
        Duration::from_secs(self.vessel_timeout_secs)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_hours.saturating_mul(3600))
    }

    pub fn refetch_overlap(&self) -> Duration {
        Duration::from_secs(self.refetch_overlap_minutes.saturating_mul(60))
    }

    pub fn page_span(&self) -> Duration {
        Duration::from_secs(self.page_span_hours.saturating_mul(3600))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

#[cfg(test)]
impl Config {
    pub(crate) fn for_tests(data_dir: PathBuf) -> Self {
        let mut config = Self {
            api_base_url: "http://127.0.0.1:9/".to_string(),
            api_key: "test-key".to_string(),
            data_dir,
            max_workers: 4,
            retry_attempts: 1,
            retry_backoff_ms: 0,
            request_timeout_secs: 5,
            vessel_timeout_secs: 5,
            days_to_keep: 90,
            history_days: 5,
            lookback_hours: 24,
            refetch_overlap_minutes: 60,
            page_span_hours: 24,
            sample_interval_secs: 300,
            run_mode: RunMode::All,
            otlp_endpoint: None,
        };
        config.clamp();
        config
    }
}
