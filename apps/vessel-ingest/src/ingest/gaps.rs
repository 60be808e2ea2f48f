use super::types::{Gap, SignalReading};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;

/// Gaps are closed intervals from the first to the last missing timestamp. Two
/// missing samples belong to the same run when nothing present lies between
/// them and they are at most one cadence apart.
#[derive(Debug, Clone, Copy)]
pub struct GapDetector {
    cadence: ChronoDuration,
    since: Option<DateTime<Utc>>,
}

impl GapDetector {
    pub fn new(cadence: ChronoDuration) -> Self {
        Self {
            cadence: cadence.max(ChronoDuration::seconds(1)),
            since: None,
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn detect(&self, readings: &[SignalReading], recorded_at: DateTime<Utc>) -> Vec<Gap> {
        let mut series: BTreeMap<(&str, &str), Vec<&SignalReading>> = BTreeMap::new();
        for reading in readings {
            series
                .entry((reading.vessel_id.as_str(), reading.signal_id.as_str()))
                .or_default()
                .push(reading);
        }

        let mut gaps = Vec::new();
        for ((vessel_id, signal_id), mut points) in series {
            points.sort_by_key(|r| r.timestamp);

            let mut runs = Vec::new();
            let mut open: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
            for point in points {
                if !point.is_missing() {
                    runs.extend(open.take());
                    continue;
                }
                open = match open {
                    Some((start, end)) if point.timestamp - end <= self.cadence => {
                        Some((start, point.timestamp))
                    }
                    Some(run) => {
                        runs.push(run);
                        Some((point.timestamp, point.timestamp))
                    }
                    None => Some((point.timestamp, point.timestamp)),
                };
            }
            runs.extend(open);

            gaps.extend(
                runs.into_iter()
                    .filter(|(_, end)| self.since.map_or(true, |since| *end >= since))
                    .map(|(start, end)| gap(vessel_id, signal_id, start, end, recorded_at)),
            );
        }
        gaps
    }
}

fn gap(
    vessel_id: &str,
    signal_id: &str,
    gap_start: DateTime<Utc>,
    gap_end: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
) -> Gap {
    Gap {
        vessel_id: vessel_id.to_string(),
        signal_id: signal_id.to_string(),
        gap_start,
        gap_end,
        recorded_at,
    }
}
