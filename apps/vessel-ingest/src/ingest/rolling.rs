use super::store::{
    read_state_json, write_state_json, DailySummaryStore, Dataset, PartitionStore, StoreError,
};
use super::types::{DayKey, Provenance, SignalReading};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

pub const REFERENCE_WINDOW_STATE: &str = "reference_window";
const REFERENCE_WINDOW_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceWindow {
    pub schema_version: u32,
    pub retention: u32,
    pub days: VecDeque<DayKey>,
    #[serde(default)]
    pub rotated_at: Option<DateTime<Utc>>,
}

impl ReferenceWindow {
    pub fn empty(retention: u32) -> Self {
        Self {
            schema_version: REFERENCE_WINDOW_SCHEMA_VERSION,
            retention,
            days: VecDeque::new(),
            rotated_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn newest(&self) -> Option<DayKey> {
        self.days.back().copied()
    }

    pub fn oldest(&self) -> Option<DayKey> {
        self.days.front().copied()
    }

    pub fn contains(&self, day: DayKey) -> bool {
        self.days.contains(&day)
    }

    fn admit(&mut self, day: DayKey) -> Vec<DayKey> {
        if self.newest().is_some_and(|newest| day <= newest) {
            return Vec::new();
        }
        self.days.push_back(day);
        self.evict_overflow()
    }

    fn evict_overflow(&mut self) -> Vec<DayKey> {
        let mut evicted = Vec::new();
        while self.days.len() > self.retention as usize {
            if let Some(day) = self.days.pop_front() {
                evicted.push(day);
            }
        }
        evicted
    }

    fn set_retention(&mut self, retention: u32) -> Vec<DayKey> {
        self.retention = retention;
        self.evict_overflow()
    }

    pub fn horizon(&self, today: DayKey) -> DateTime<Utc> {
        today.minus_days(self.retention).start()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationOutcome {
    pub admitted: Vec<DayKey>,
    pub evicted: Vec<DayKey>,
    pub backfilled: Vec<DayKey>,
    pub rotated: bool,
}

impl RotationOutcome {
    pub fn changed(&self) -> bool {
        !self.admitted.is_empty() || !self.evicted.is_empty() || !self.backfilled.is_empty()
    }
}

pub struct ReferenceWindowRotator<'a> {
    store: &'a dyn PartitionStore,
    retention: u32,
}

impl<'a> ReferenceWindowRotator<'a> {
    pub fn new(store: &'a dyn PartitionStore, retention: u32) -> Self {
        Self { store, retention }
    }

    pub fn load(&self) -> Result<ReferenceWindow, StoreError> {
        let window = read_state_json::<ReferenceWindow>(self.store, REFERENCE_WINDOW_STATE)?;
        Ok(window.unwrap_or_else(|| ReferenceWindow::empty(self.retention)))
    }

/// Rotation only happens while today's summary partition is absent, so a
/// second run on the same day is a no-op.
    pub fn rotate(
        &self,
        today: DayKey,
        now: DateTime<Utc>,
    ) -> Result<(ReferenceWindow, RotationOutcome), StoreError> {
        let mut window = self.load()?;
        let mut outcome = RotationOutcome::default();
        let summaries = DailySummaryStore::new(self.store);

        let retention_changed = window.retention != self.retention;
        if retention_changed {
            tracing::info!(
                from = window.retention,
                to = self.retention,
                "reference window retention changed"
            );
            outcome.evicted.extend(window.set_retention(self.retention));
        }
        // Days at or after today never belong in the window.
        while window.newest().is_some_and(|newest| newest >= today) {
            if let Some(day) = window.days.pop_back() {
                outcome.evicted.push(day);
            }
        }

        let frozen: Vec<DayKey> = self
            .store
            .list_partitions(Dataset::DailySummary)?
            .into_iter()
            .filter(|day| *day < today)
            .collect();

        if !summaries.exists(today)? {
            outcome.rotated = true;
            let after = window.newest();
            for day in frozen
                .iter()
                .copied()
                .filter(|day| after.map_or(true, |newest| *day > newest))
            {
                outcome.admitted.push(day);
                outcome.evicted.extend(window.admit(day));
            }
        }

        // Fill from older partitions when retention leaves room.
        if window.len() < window.retention as usize {
            let oldest = window.oldest();
            let mut older: Vec<DayKey> = frozen
                .iter()
                .copied()
                .filter(|day| oldest.map_or(true, |front| *day < front))
                .filter(|day| !outcome.evicted.contains(day))
                .collect();
            while window.len() < window.retention as usize {
                let Some(day) = older.pop() else {
                    break;
                };
                window.days.push_front(day);
                outcome.backfilled.push(day);
            }
        }

        if outcome.changed() || retention_changed {
            window.rotated_at = Some(now);
            write_state_json(self.store, REFERENCE_WINDOW_STATE, &window)?;
            tracing::info!(
                today = %today,
                admitted = outcome.admitted.len(),
                evicted = outcome.evicted.len(),
                backfilled = outcome.backfilled.len(),
                window_days = window.len(),
                "reference window rotated"
            );
        }

        Ok((window, outcome))
    }
}

/// Frozen summaries carry the history before them, so partitions are read
/// newest first and a key already seen is skipped in older ones.
pub fn load_reference_readings(
    store: &dyn PartitionStore,
    window: &ReferenceWindow,
    today: DayKey,
) -> Vec<SignalReading> {
    let summaries = DailySummaryStore::new(store);
    let horizon = window.horizon(today);
    let mut seen = HashSet::new();
    let mut readings = Vec::new();
    for day in window.days.iter().rev() {
        match summaries.read(*day, Provenance::Old) {
            Ok(rows) => readings.extend(
                rows.into_iter()
                    .filter(|r| r.timestamp >= horizon && seen.insert(r.key())),
            ),
            Err(err) => {
                tracing::warn!(day = %day, error = %err, "skipping unreadable reference partition");
            }
        }
    }
    readings
}
