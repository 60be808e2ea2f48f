use super::types::{Provenance, ReadingKey, SignalReading};
use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub kept_new: usize,
    pub kept_today: usize,
    pub kept_old: usize,
    pub superseded: usize,
    pub expired: usize,
}

/// For every `(vessel, signal, timestamp)` the winner is the `new` candidate
/// if any, else the `today` one, else the `old` one. Within a tier the last
/// candidate in input order wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationMerger {
    horizon: Option<DateTime<Utc>>,
}

impl ReconciliationMerger {
    pub fn with_horizon(horizon: DateTime<Utc>) -> Self {
        Self {
            horizon: Some(horizon),
        }
    }

    pub fn merge(
        &self,
        reference: impl IntoIterator<Item = SignalReading>,
        today: impl IntoIterator<Item = SignalReading>,
        fresh: impl IntoIterator<Item = SignalReading>,
    ) -> (Vec<SignalReading>, MergeStats) {
        let mut stats = MergeStats::default();
        let mut winners: BTreeMap<ReadingKey, SignalReading> = BTreeMap::new();

        let tagged = reference
            .into_iter()
            .map(|r| r.with_tag(Provenance::Old))
            .chain(today.into_iter().map(|r| r.with_tag(Provenance::Today)))
            .chain(fresh.into_iter().map(|r| r.with_tag(Provenance::New)));

        for candidate in tagged {
            match winners.entry(candidate.key()) {
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
                Entry::Occupied(mut slot) => {
                    stats.superseded += 1;
                    if candidate.tag >= slot.get().tag {
                        slot.insert(candidate);
                    }
                }
            }
        }

        let mut merged = Vec::with_capacity(winners.len());
        for reading in winners.into_values() {
            match reading.tag {
                Provenance::New => stats.kept_new += 1,
                Provenance::Today => stats.kept_today += 1,
                Provenance::Old => {
                    if self.horizon.is_some_and(|h| reading.timestamp < h) {
                        stats.expired += 1;
                        continue;
                    }
                    stats.kept_old += 1;
                }
            }
            merged.push(reading);
        }

        (merged, stats)
    }
}
