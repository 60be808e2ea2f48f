use super::store::memory::MemoryPartitionStore;
use super::store::read_state_json;
use super::{DailySummaryStore, Dataset, DayKey, FetchWindow, GapStore, PartitionStore, Provenance};
use crate::api::{FetchError, FleetSource, VesselInfo};
use crate::catalog::SignalMapping;
use crate::config::Config;
use crate::pipeline::{Pipeline, PipelineSettings, RunMode, VESSELS_STATE};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Serves canned payloads and records every timeseries request.
#[derive(Default)]
struct ScriptedSource {
    fleet: Vec<VesselInfo>,
    catalogs: HashMap<String, Value>,
    timeseries: Mutex<HashMap<String, Value>>,
    failing: Vec<String>,
    requests: Mutex<Vec<(String, FetchWindow)>>,
}

impl ScriptedSource {
    fn with_vessels(imos: &[&str]) -> Self {
        Self {
            fleet: imos
                .iter()
                .map(|imo| VesselInfo {
                    imo: imo.to_string(),
                    active: true,
                })
                .collect(),
            ..Self::default()
        }
    }

    fn set_timeseries(&self, imo: &str, payload: Value) {
        self.timeseries
            .lock()
            .unwrap()
            .insert(imo.to_string(), payload);
    }

    fn requests_for(&self, imo: &str) -> Vec<FetchWindow> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(vessel, _)| vessel == imo)
            .map(|(_, window)| *window)
            .collect()
    }
}

#[async_trait]
impl FleetSource for ScriptedSource {
    async fn fetch_fleet(&self) -> Result<Vec<VesselInfo>, FetchError> {
        Ok(self.fleet.clone())
    }

    async fn fetch_signals(&self, vessel_id: &str) -> Result<Value, FetchError> {
        Ok(self
            .catalogs
            .get(vessel_id)
            .cloned()
            .unwrap_or_else(|| json!({"imo": vessel_id, "signals": {}})))
    }

    async fn fetch_timeseries(
        &self,
        vessel_id: &str,
        window: &FetchWindow,
    ) -> Result<Value, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push((vessel_id.to_string(), *window));
        if self.failing.iter().any(|v| v == vessel_id) {
            return Err(FetchError::Status {
                url: format!("fleet/{vessel_id}/timeseries"),
                status: StatusCode::SERVICE_UNAVAILABLE,
            });
        }
        Ok(self
            .timeseries
            .lock()
            .unwrap()
            .get(vessel_id)
            .cloned()
            .unwrap_or_else(|| json!({})))
    }
}

fn settings(mode: RunMode) -> PipelineSettings {
    let mut config = Config::for_tests(PathBuf::from("/unused"));
    config.run_mode = mode;
    config.history_days = 3;
    config.days_to_keep = 10;
    PipelineSettings::from_config(&config)
}

fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, h, m, 0).unwrap()
}

fn day(raw: &str) -> DayKey {
    raw.parse().unwrap()
}

fn pipeline(
    mode: RunMode,
    source: &Arc<ScriptedSource>,
    store: &Arc<MemoryPartitionStore>,
) -> Pipeline {
    Pipeline::new(settings(mode), source.clone(), store.clone())
}

#[tokio::test]
async fn repeated_runs_converge_and_gaps_heal() -> Result<()> {
    let mut source = ScriptedSource::with_vessels(&["9123456"]);
    source.catalogs.insert(
        "9123456".to_string(),
        json!({"imo": "9123456", "signals": {"sog": {"friendly_name": "Speed over ground"}}}),
    );
    let source = Arc::new(source);
    let store = Arc::new(MemoryPartitionStore::default());
    source.set_timeseries(
        "9123456",
        json!({
            "timestamp": "2025-03-05T12:00:00Z",
            "sog": {
                "2025-03-05T10:00:00Z": 5.0,
                "2025-03-05T10:05:00Z": null,
                "2025-03-05T10:10:00Z": null,
                "2025-03-05T10:15:00Z": 7.0
            }
        }),
    );

    let first = pipeline(RunMode::All, &source, &store)
        .run_once(at(5, 12, 0))
        .await?;
    assert_eq!(first.vessels_fetched, 1);
    assert_eq!(first.merged_readings, 4);
    assert_eq!(first.gaps, 1);
    assert_eq!(first.signals_added, 1);

    let gaps = GapStore::new(store.as_ref()).read(day("20250305"))?;
    assert_eq!(gaps[0].gap_start, at(5, 10, 5));
    assert_eq!(gaps[0].gap_end, at(5, 10, 10));

    // Same payload again: nothing accumulates.
    let second = pipeline(RunMode::All, &source, &store)
        .run_once(at(5, 12, 30))
        .await?;
    assert_eq!(second.merged_readings, 4);

    source.set_timeseries(
        "9123456",
        json!({
            "sog": {
                "2025-03-05T10:05:00Z": 5.5,
                "2025-03-05T10:10:00Z": 6.0
            }
        }),
    );
    let third = pipeline(RunMode::Timeseries, &source, &store)
        .run_once(at(5, 13, 0))
        .await?;
    assert_eq!(third.gaps, 0);
    assert!(GapStore::new(store.as_ref()).read(day("20250305"))?.is_empty());

    let summary = DailySummaryStore::new(store.as_ref()).read(day("20250305"), Provenance::Today)?;
    assert_eq!(summary.len(), 4);
    assert!(summary.iter().all(|r| r.value.is_some()));
    assert!(summary
        .iter()
        .all(|r| r.friendly_name.as_deref() == Some("Speed over ground")));
    Ok(())
}

#[tokio::test]
async fn failed_vessel_contributes_nothing_but_run_succeeds() -> Result<()> {
    let mut source = ScriptedSource::with_vessels(&["1111111", "2222222"]);
    source.failing.push("2222222".to_string());
    let source = Arc::new(source);
    source.set_timeseries("1111111", json!({"sog": {"2025-03-05T10:00:00Z": 1.0}}));
    let store = Arc::new(MemoryPartitionStore::default());

    let report = pipeline(RunMode::All, &source, &store)
        .run_once(at(5, 12, 0))
        .await?;
    assert_eq!(report.vessels_total, 2);
    assert_eq!(report.vessels_fetched, 1);
    assert_eq!(report.vessels_failed, 1);
    assert_eq!(report.merged_readings, 1);
    Ok(())
}

#[tokio::test]
async fn every_vessel_shares_the_run_timestamp_and_later_runs_resume_from_watermark() -> Result<()> {
    let source = Arc::new(ScriptedSource::with_vessels(&["1111111", "2222222"]));
    source.set_timeseries("1111111", json!({"sog": {"2025-03-05T11:00:00Z": 1.0}}));
    let store = Arc::new(MemoryPartitionStore::default());

    pipeline(RunMode::All, &source, &store)
        .run_once(at(5, 12, 0))
        .await?;
    let first_a = source.requests_for("1111111");
    let first_b = source.requests_for("2222222");
    assert_eq!(first_a.last().unwrap().to, at(5, 12, 0));
    assert_eq!(first_b.last().unwrap().to, at(5, 12, 0));
    assert_eq!(first_a[0].from, at(4, 12, 0));

    pipeline(RunMode::Timeseries, &source, &store)
        .run_once(at(5, 18, 0))
        .await?;
    let second_a = source.requests_for("1111111");
    let resumed = second_a.last().unwrap();
    // Watermark 11:00 minus one hour of overlap.
    assert_eq!(resumed.from, at(5, 10, 0));
    assert_eq!(resumed.to, at(5, 18, 0));
    // No persisted readings for the second vessel: back to the lookback floor.
    assert_eq!(source.requests_for("2222222").last().unwrap().from, at(4, 18, 0));
    Ok(())
}

#[tokio::test]
async fn day_rollover_feeds_reference_and_fresh_values_win() -> Result<()> {
    let source = Arc::new(ScriptedSource::with_vessels(&["9123456"]));
    let store = Arc::new(MemoryPartitionStore::default());
    source.set_timeseries(
        "9123456",
        json!({"sog": {"2025-03-04T23:50:00Z": 1.0, "2025-03-04T23:55:00Z": 2.0}}),
    );
    pipeline(RunMode::All, &source, &store)
        .run_once(at(4, 23, 58))
        .await?;

    // The vessel re-sends a corrected value for 23:55 after midnight.
    source.set_timeseries("9123456", json!({"sog": {"2025-03-04T23:55:00Z": 2.5}}));
    let report = pipeline(RunMode::All, &source, &store)
        .run_once(at(5, 0, 10))
        .await?;
    assert!(report.rotation.rotated);
    assert_eq!(report.rotation.admitted, vec![day("20250304")]);

    let summary = DailySummaryStore::new(store.as_ref()).read(day("20250305"), Provenance::Today)?;
    let value_at = |ts| summary.iter().find(|r| r.timestamp == ts).map(|r| r.value);
    assert_eq!(value_at(at(4, 23, 50)), Some(Some(1.0)));
    assert_eq!(value_at(at(4, 23, 55)), Some(Some(2.5)));
    Ok(())
}

#[tokio::test]
async fn summary_write_failure_fails_the_run_before_gaps() -> Result<()> {
    let source = Arc::new(ScriptedSource::with_vessels(&["9123456"]));
    source.set_timeseries("9123456", json!({"sog": {"2025-03-05T10:00:00Z": null}}));
    let store = Arc::new(MemoryPartitionStore::default());
    store.fail_writes(true);

    let result = pipeline(RunMode::All, &source, &store)
        .run_once(at(5, 12, 0))
        .await;
    assert!(result.is_err());
    assert!(store.raw_partition(Dataset::Gaps, day("20250305")).is_none());
    Ok(())
}

#[tokio::test]
async fn timeseries_mode_requires_a_stored_vessel_list() -> Result<()> {
    let source = Arc::new(ScriptedSource::with_vessels(&["9123456"]));
    let store = Arc::new(MemoryPartitionStore::default());
    assert!(pipeline(RunMode::Timeseries, &source, &store)
        .run_once(at(5, 12, 0))
        .await
        .is_err());

    let report = pipeline(RunMode::Fleet, &source, &store)
        .run_once(at(5, 12, 0))
        .await?;
    assert_eq!(report.vessels_total, 1);
    assert!(source.requests_for("9123456").is_empty());
    assert_eq!(
        read_state_json::<Vec<String>>(store.as_ref(), VESSELS_STATE)?,
        Some(vec!["9123456".to_string()])
    );
    assert_eq!(SignalMapping::load(store.as_ref())?.len(), 0);

    pipeline(RunMode::Timeseries, &source, &store)
        .run_once(at(5, 12, 30))
        .await?;
    assert_eq!(source.requests_for("9123456").len(), 1);
    Ok(())
}

#[tokio::test]
async fn expired_partitions_are_pruned_but_window_days_kept() -> Result<()> {
    let source = Arc::new(ScriptedSource::with_vessels(&["9123456"]));
    let store = Arc::new(MemoryPartitionStore::default());
    let summaries = DailySummaryStore::new(store.as_ref());
    for raw in ["20250201", "20250220", "20250303", "20250304"] {
        summaries.write(day(raw), &[], at(1, 0, 0))?;
    }
    store.put_raw_partition(Dataset::Gaps, day("20250201"), b"{}");

    let report = pipeline(RunMode::All, &source, &store)
        .run_once(at(5, 12, 0))
        .await?;
    assert_eq!(report.partitions_pruned, 2);
    assert!(!store.partition_exists(Dataset::DailySummary, day("20250201"))?);
    assert!(!store.partition_exists(Dataset::Gaps, day("20250201"))?);
    // Older than the cutoff but still one of the last three frozen days.
    assert!(store.partition_exists(Dataset::DailySummary, day("20250220"))?);
    assert!(store.partition_exists(Dataset::DailySummary, day("20250304"))?);
    Ok(())
}

#[tokio::test]
async fn gaps_from_frozen_days_stay_in_their_own_partition() -> Result<()> {
    let source = Arc::new(ScriptedSource::with_vessels(&["9123456"]));
    let store = Arc::new(MemoryPartitionStore::default());
    source.set_timeseries(
        "9123456",
        json!({"sog": {
            "2025-03-04T10:00:00Z": 1.0,
            "2025-03-04T10:05:00Z": null,
            "2025-03-04T10:10:00Z": 2.0
        }}),
    );
    let frozen = pipeline(RunMode::All, &source, &store)
        .run_once(at(4, 12, 0))
        .await?;
    assert_eq!(frozen.gaps, 1);

    source.set_timeseries("9123456", json!({}));
    for later in [5, 6] {
        let report = pipeline(RunMode::All, &source, &store)
            .run_once(at(later, 12, 0))
            .await?;
        assert_eq!(report.gaps, 0);
        let key = DayKey::of(at(later, 0, 0));
        assert!(GapStore::new(store.as_ref()).read(key)?.is_empty());
        // The missing sample is still carried as history.
        let summary = DailySummaryStore::new(store.as_ref()).read(key, Provenance::Today)?;
        assert!(summary
            .iter()
            .any(|r| r.timestamp == at(4, 10, 5) && r.value.is_none()));
    }

    let recorded = GapStore::new(store.as_ref()).read(day("20250304"))?;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].gap_start, at(4, 10, 5));
    assert_eq!(recorded[0].recorded_at, at(4, 12, 0));
    Ok(())
}
