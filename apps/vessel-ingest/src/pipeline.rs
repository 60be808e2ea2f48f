use crate::api::{FetchError, FleetSource};
use crate::catalog::SignalMapping;
use crate::config::Config;
use crate::ingest::store::{read_state_json, write_state_json};
use crate::ingest::{
    load_reference_readings, DailySummaryStore, Dataset, DayKey, FetchWindow, FetchWindowPlanner,
    GapDetector, GapStore, PartitionStore, PersistedWatermarks, Provenance, ReconciliationMerger,
    ReferenceWindow, ReferenceWindowRotator, RotationOutcome, SignalReading,
};
use crate::telemetry::{flatten_timeseries, FlattenOutcome};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

pub const VESSELS_STATE: &str = "vessels";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    All,
    Timeseries,
    Fleet,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::All => "all",
            RunMode::Timeseries => "timeseries",
            RunMode::Fleet => "fleet",
        }
    }

    pub fn refreshes_fleet(&self) -> bool {
        matches!(self, RunMode::All | RunMode::Fleet)
    }

    pub fn reconciles(&self) -> bool {
        matches!(self, RunMode::All | RunMode::Timeseries)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown run mode {0:?}; expected all, timeseries or fleet")]
pub struct RunModeError(String);

impl FromStr for RunMode {
    type Err = RunModeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(RunMode::All),
            "timeseries" => Ok(RunMode::Timeseries),
            "fleet" => Ok(RunMode::Fleet),
            _ => Err(RunModeError(raw.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct FetchStats {
    pub vessels_fetched: AtomicU64,
    pub vessels_failed: AtomicU64,
    pub fresh_readings: AtomicU64,
    pub malformed_dropped: AtomicU64,
}

impl FetchStats {
    fn record_success(&self, outcome: &FlattenOutcome) {
        self.vessels_fetched.fetch_add(1, Ordering::Relaxed);
        self.fresh_readings
            .fetch_add(outcome.readings.len() as u64, Ordering::Relaxed);
        self.malformed_dropped
            .fetch_add(outcome.malformed as u64, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.vessels_failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub mode: RunMode,
    pub history_days: u32,
    pub days_to_keep: u32,
    pub max_workers: usize,
    pub vessel_timeout: Duration,
    pub lookback: ChronoDuration,
    pub refetch_overlap: ChronoDuration,
    pub page_span: ChronoDuration,
    pub cadence: ChronoDuration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.run_mode,
            history_days: config.history_days,
            days_to_keep: config.days_to_keep.max(1),
            max_workers: config.max_workers.max(1),
            vessel_timeout: config.vessel_timeout(),
            lookback: chrono_secs(config.lookback()),
            refetch_overlap: chrono_secs(config.refetch_overlap()),
            page_span: chrono_secs(config.page_span()),
            cadence: chrono_secs(config.sample_interval()),
        }
    }
}

// Window arithmetic on DateTime<Utc> panics near chrono's range limits.
const MAX_SPAN_SECS: i64 = 100 * 366 * 24 * 3600;

fn chrono_secs(duration: Duration) -> ChronoDuration {
    let secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
    ChronoDuration::seconds(secs.min(MAX_SPAN_SECS))
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub day: DayKey,
    pub mode: RunMode,
    pub vessels_total: usize,
    pub vessels_fetched: u64,
    pub vessels_failed: u64,
    pub fresh_readings: u64,
    pub malformed_dropped: u64,
    pub merged_readings: usize,
    pub gaps: usize,
    pub signals_added: usize,
    pub signals_renamed: usize,
    pub partitions_pruned: usize,
    pub rotation: RotationOutcome,
}

impl RunReport {
    fn new(run_id: Uuid, day: DayKey, mode: RunMode) -> Self {
        Self {
            run_id,
            day,
            mode,
            vessels_total: 0,
            vessels_fetched: 0,
            vessels_failed: 0,
            fresh_readings: 0,
            malformed_dropped: 0,
            merged_readings: 0,
            gaps: 0,
            signals_added: 0,
            signals_renamed: 0,
            partitions_pruned: 0,
            rotation: RotationOutcome::default(),
        }
    }
}

// Runs must be serialized by the caller; the store is single-writer per day.
pub struct Pipeline {
    settings: PipelineSettings,
    source: Arc<dyn FleetSource>,
    store: Arc<dyn PartitionStore>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        source: Arc<dyn FleetSource>,
        store: Arc<dyn PartitionStore>,
    ) -> Self {
        Self {
            settings,
            source,
            store,
        }
    }

    pub async fn run_once(&self, run_at: DateTime<Utc>) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let today = DayKey::of(run_at);
        let span = tracing::info_span!("run", %run_id, day = %today, mode = %self.settings.mode);
        self.run_inner(run_id, today, run_at).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        today: DayKey,
        run_at: DateTime<Utc>,
    ) -> Result<RunReport> {
        let mode = self.settings.mode;
        let store = self.store.as_ref();
        let mut report = RunReport::new(run_id, today, mode);

        let mut mapping = SignalMapping::load(store).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "stored signal mapping unreadable; starting empty");
            SignalMapping::default()
        });

        let vessels = if mode.refreshes_fleet() {
            let vessels = self.refresh_fleet(&mut mapping, &mut report).await?;
            report.vessels_total = vessels.len();
            if !mode.reconciles() {
                tracing::info!(vessels = vessels.len(), signals = mapping.len(), "fleet refreshed");
                return Ok(report);
            }
            vessels
        } else {
            read_state_json::<Vec<String>>(store, VESSELS_STATE)
                .context("failed to read stored vessel list")?
                .context("no stored vessel list; run in `fleet` or `all` mode first")?
        };
        report.vessels_total = vessels.len();

        let (window, rotation) = ReferenceWindowRotator::new(store, self.settings.history_days)
            .rotate(today, run_at)
            .context("failed to rotate reference window")?;
        report.rotation = rotation;

        let reference = load_reference_readings(store, &window, today);
        let stored_today = DailySummaryStore::new(store)
            .read(today, Provenance::Today)
            .with_context(|| format!("failed to read daily summary {today}"))?;

        let watermarks = PersistedWatermarks::from_readings(reference.iter().chain(&stored_today));
        let planner = FetchWindowPlanner::new(
            run_at,
            self.settings.lookback,
            self.settings.refetch_overlap,
        );
        let plans: Vec<(String, FetchWindow)> = vessels
            .into_iter()
            .map(|vessel| {
                let window = planner.plan(&vessel, &watermarks);
                (vessel, window)
            })
            .collect();

        let stats = Arc::new(FetchStats::default());
        let fresh = self
            .fetch_all(plans, Arc::new(mapping), stats.clone())
            .await;
        report.vessels_fetched = stats.vessels_fetched.load(Ordering::Relaxed);
        report.vessels_failed = stats.vessels_failed.load(Ordering::Relaxed);
        report.fresh_readings = stats.fresh_readings.load(Ordering::Relaxed);
        report.malformed_dropped = stats.malformed_dropped.load(Ordering::Relaxed);

        let merger = ReconciliationMerger::with_horizon(window.horizon(today));
        let (merged, merge_stats) = merger.merge(reference, stored_today, fresh);
        tracing::debug!(?merge_stats, "merge complete");
        report.merged_readings = merged.len();

        DailySummaryStore::new(store)
            .write(today, &merged, run_at)
            .with_context(|| format!("failed to write daily summary {today}"))?;

        let gaps = GapDetector::new(self.settings.cadence)
            .since(today.start())
            .detect(&merged, run_at);
        report.gaps = gaps.len();
        GapStore::new(store)
            .write(today, &gaps, run_at)
            .with_context(|| format!("failed to write gaps {today}"))?;

        report.partitions_pruned = self.prune_expired(today, &window);

        tracing::info!(
            vessels = report.vessels_total,
            fetched = report.vessels_fetched,
            failed = report.vessels_failed,
            fresh = report.fresh_readings,
            malformed = report.malformed_dropped,
            merged = report.merged_readings,
            gaps = report.gaps,
            pruned = report.partitions_pruned,
            "run complete"
        );
        Ok(report)
    }

    async fn refresh_fleet(
        &self,
        mapping: &mut SignalMapping,
        report: &mut RunReport,
    ) -> Result<Vec<String>> {
        let store = self.store.as_ref();
        let fleet = self
            .source
            .fetch_fleet()
            .await
            .context("failed to fetch fleet list")?;
        let vessels: Vec<String> = fleet
            .into_iter()
            .filter(|vessel| vessel.active)
            .map(|vessel| vessel.imo)
            .collect();
        write_state_json(store, VESSELS_STATE, &vessels)
            .context("failed to store vessel list")?;

        let permits = Arc::new(Semaphore::new(self.settings.max_workers));
        let lookups = vessels.iter().map(|vessel| {
            let source = self.source.clone();
            let permits = permits.clone();
            async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => source.fetch_signals(vessel).await,
                    Err(_) => Ok(serde_json::Value::Null),
                };
                (vessel, result)
            }
        });
        let catalogs = join_all(lookups).await;

        for (vessel, result) in catalogs {
            match result {
                Ok(payload) => {
                    let (added, renamed) = mapping.absorb_catalog(vessel, &payload);
                    report.signals_added += added;
                    report.signals_renamed += renamed;
                }
                Err(err) => {
                    tracing::warn!(vessel = %vessel, error = %err, "failed to fetch signal catalog");
                }
            }
        }
        if let Err(err) = mapping.save(store) {
            tracing::warn!(error = %err, "failed to store signal mapping");
        }
        Ok(vessels)
    }

    async fn fetch_all(
        &self,
        plans: Vec<(String, FetchWindow)>,
        mapping: Arc<SignalMapping>,
        stats: Arc<FetchStats>,
    ) -> Vec<SignalReading> {
        let permits = Arc::new(Semaphore::new(self.settings.max_workers));
        let mut tasks = JoinSet::new();
        let mut slots: Vec<Option<Vec<SignalReading>>> = vec![None; plans.len()];

        for (index, (vessel, window)) in plans.into_iter().enumerate() {
            let source = self.source.clone();
            let mapping = mapping.clone();
            let stats = stats.clone();
            let permits = permits.clone();
            let page_span = self.settings.page_span;
            let timeout = self.settings.vessel_timeout;

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (index, Vec::new());
                };
                let fetch = fetch_vessel(source.as_ref(), &vessel, window, page_span, &mapping);
                match tokio::time::timeout(timeout, fetch).await {
                    Ok(Ok(outcome)) => {
                        stats.record_success(&outcome);
                        tracing::debug!(
                            vessel = %vessel,
                            readings = outcome.readings.len(),
                            from = %window.from,
                            to = %window.to,
                            "vessel fetched"
                        );
                        (index, outcome.readings)
                    }
                    Ok(Err(err)) => {
                        stats.record_failure();
                        tracing::warn!(vessel = %vessel, error = %err, "vessel fetch failed; skipping this run");
                        (index, Vec::new())
                    }
                    Err(_) => {
                        stats.record_failure();
                        tracing::warn!(
                            vessel = %vessel,
                            timeout_secs = timeout.as_secs(),
                            "vessel fetch timed out; skipping this run"
                        );
                        (index, Vec::new())
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, readings)) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(readings);
                    }
                }
                Err(err) => {
                    stats.record_failure();
                    tracing::warn!(error = %err, "vessel fetch task aborted");
                }
            }
        }

        slots.into_iter().flatten().flatten().collect()
    }

    fn prune_expired(&self, today: DayKey, window: &ReferenceWindow) -> usize {
        let cutoff = today.minus_days(self.settings.days_to_keep);
        let store = self.store.as_ref();
        let mut pruned = 0;
        for dataset in [Dataset::DailySummary, Dataset::Gaps] {
            let days = match store.list_partitions(dataset) {
                Ok(days) => days,
                Err(err) => {
                    tracing::warn!(dataset = dataset.dir_name(), error = %err, "failed to list partitions for cleanup");
                    continue;
                }
            };
            for day in days
                .into_iter()
                .filter(|day| *day < cutoff && !window.contains(*day))
            {
                match store.delete_partition(dataset, day) {
                    Ok(true) => pruned += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(dataset = dataset.dir_name(), day = %day, error = %err, "failed to delete expired partition");
                    }
                }
            }
        }
        if pruned > 0 {
            tracing::info!(pruned, cutoff = %cutoff, "expired partitions removed");
        }
        pruned
    }
}

async fn fetch_vessel(
    source: &dyn FleetSource,
    vessel: &str,
    window: FetchWindow,
    page_span: ChronoDuration,
    mapping: &SignalMapping,
) -> Result<FlattenOutcome, FetchError> {
    let mut combined = FlattenOutcome::default();
    for page in window.pages(page_span) {
        let payload = source.fetch_timeseries(vessel, &page).await?;
        let outcome = flatten_timeseries(vessel, &payload, mapping);
        combined.readings.extend(outcome.readings);
        combined.malformed += outcome.malformed;
    }
    Ok(combined)
}
