use super::types::SignalReading;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl FetchWindow {
    pub fn pages(&self, span: ChronoDuration) -> Vec<FetchWindow> {
        if span <= ChronoDuration::zero() || self.from >= self.to {
            return vec![*self];
        }
        let mut pages = Vec::new();
        let mut cursor = self.from;
        while cursor < self.to {
            let end = (cursor + span).min(self.to);
            pages.push(FetchWindow {
                from: cursor,
                to: end,
            });
            cursor = end;
        }
        pages
    }
}

#[derive(Debug, Default, Clone)]
pub struct PersistedWatermarks {
    latest: HashMap<String, BTreeMap<String, DateTime<Utc>>>,
}

impl PersistedWatermarks {
    pub fn from_readings<'a>(readings: impl IntoIterator<Item = &'a SignalReading>) -> Self {
        let mut watermarks = Self::default();
        for reading in readings {
            if reading.is_missing() {
                continue;
            }
            watermarks.observe(&reading.vessel_id, &reading.signal_id, reading.timestamp);
        }
        watermarks
    }

    pub fn observe(&mut self, vessel_id: &str, signal_id: &str, ts: DateTime<Utc>) {
        let per_signal = self.latest.entry(vessel_id.to_string()).or_default();
        per_signal
            .entry(signal_id.to_string())
            .and_modify(|current| {
                if ts > *current {
                    *current = ts;
                }
            })
            .or_insert(ts);
    }

    #[cfg(test)]
    pub fn signal_latest(&self, vessel_id: &str, signal_id: &str) -> Option<DateTime<Utc>> {
        self.latest
            .get(vessel_id)
            .and_then(|signals| signals.get(signal_id))
            .copied()
    }

    pub fn vessel_floor(&self, vessel_id: &str) -> Option<DateTime<Utc>> {
        self.latest
            .get(vessel_id)
            .and_then(|signals| signals.values().min())
            .copied()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchWindowPlanner {
    run_at: DateTime<Utc>,
    lookback: ChronoDuration,
    overlap: ChronoDuration,
}

impl FetchWindowPlanner {
    pub fn new(run_at: DateTime<Utc>, lookback: ChronoDuration, overlap: ChronoDuration) -> Self {
        Self {
            run_at,
            lookback: lookback.max(ChronoDuration::zero()),
            overlap: overlap.max(ChronoDuration::zero()),
        }
    }

    pub fn plan(&self, vessel_id: &str, watermarks: &PersistedWatermarks) -> FetchWindow {
        let to = self.run_at;
        let from = match watermarks.vessel_floor(vessel_id) {
            Some(floor) => floor - self.overlap,
            None => to - self.lookback,
        };
        FetchWindow {
            from: from.min(to),
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::Provenance;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, 0).unwrap()
    }

    fn reading(vessel: &str, signal: &str, ts: DateTime<Utc>, value: Option<f64>) -> SignalReading {
        SignalReading {
            vessel_id: vessel.to_string(),
            signal_id: signal.to_string(),
            friendly_name: None,
            timestamp: ts,
            value,
            tag: Provenance::Today,
        }
    }

    #[test]
    fn all_vessels_share_the_run_timestamp_as_upper_bound() {
        let planner =
            FetchWindowPlanner::new(at(12, 0), ChronoDuration::hours(24), ChronoDuration::hours(1));
        let mut watermarks = PersistedWatermarks::default();
        watermarks.observe("a", "speed", at(9, 0));

        let a = planner.plan("a", &watermarks);
        let b = planner.plan("b", &watermarks);
        assert_eq!(a.to, at(12, 0));
        assert_eq!(b.to, at(12, 0));
        assert_eq!(a.from, at(8, 0));
        assert_eq!(b.from, at(12, 0) - ChronoDuration::hours(24));
    }

    #[test]
    fn floor_is_the_laggiest_signal_and_ignores_missing_values() {
        let readings = vec![
            reading("a", "speed", at(11, 0), Some(10.0)),
            reading("a", "rpm", at(7, 30), Some(80.0)),
            reading("a", "rpm", at(11, 30), None),
        ];
        let watermarks = PersistedWatermarks::from_readings(&readings);
        assert_eq!(watermarks.signal_latest("a", "rpm"), Some(at(7, 30)));
        assert_eq!(watermarks.vessel_floor("a"), Some(at(7, 30)));

        let planner = FetchWindowPlanner::new(at(12, 0), ChronoDuration::hours(24), ChronoDuration::zero());
        assert_eq!(planner.plan("a", &watermarks).from, at(7, 30));
    }

    #[test]
    fn from_never_exceeds_to() {
        let mut watermarks = PersistedWatermarks::default();
        watermarks.observe("a", "speed", at(13, 0));
        let planner = FetchWindowPlanner::new(at(12, 0), ChronoDuration::hours(24), ChronoDuration::zero());
        let window = planner.plan("a", &watermarks);
        assert_eq!(window.from, window.to);
    }

    #[test]
    fn pages_cover_the_window_and_end_on_its_upper_bound() {
        let window = FetchWindow {
            from: at(0, 0),
            to: at(10, 30),
        };
        let pages = window.pages(ChronoDuration::hours(4));
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].from, at(0, 0));
        assert_eq!(pages[1].from, pages[0].to);
        assert_eq!(pages[2].to, at(10, 30));

        let single = window.pages(ChronoDuration::zero());
        assert_eq!(single, vec![window]);
    }
}
