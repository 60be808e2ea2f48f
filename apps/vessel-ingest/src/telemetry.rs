use crate::catalog::SignalMapping;
use crate::ingest::{Provenance, SignalReading};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

const METADATA_KEY: &str = "timestamp";
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Default)]
pub struct FlattenOutcome {
    pub readings: Vec<SignalReading>,
    pub malformed: usize,
}

// `{"timestamp": .., "<signal>": {"<ts>": <number|null>, ..}, ..}`, kept in payload order.
pub fn flatten_timeseries(
    vessel_id: &str,
    payload: &Value,
    mapping: &SignalMapping,
) -> FlattenOutcome {
    let mut outcome = FlattenOutcome::default();
    let Some(signals) = payload.as_object() else {
        tracing::warn!(vessel = %vessel_id, "timeseries payload is not an object; dropping it");
        outcome.malformed += 1;
        return outcome;
    };

    for (signal_id, samples) in signals {
        if signal_id == METADATA_KEY {
            continue;
        }
        let Some(samples) = samples.as_object() else {
            outcome.malformed += 1;
            continue;
        };
        let friendly_name = mapping.friendly_name(vessel_id, signal_id);
        for (raw_ts, raw_value) in samples {
            let Some(timestamp) = parse_timestamp(raw_ts) else {
                outcome.malformed += 1;
                continue;
            };
            let Some(value) = parse_value(raw_value) else {
                outcome.malformed += 1;
                continue;
            };
            outcome.readings.push(SignalReading {
                vessel_id: vessel_id.to_string(),
                signal_id: signal_id.clone(),
                friendly_name: friendly_name.map(str::to_string),
                timestamp,
                value,
                tag: Provenance::New,
            });
        }
    }

    if outcome.malformed > 0 {
        tracing::warn!(
            vessel = %vessel_id,
            dropped = outcome.malformed,
            kept = outcome.readings.len(),
            "dropped malformed timeseries entries"
        );
    }
    outcome
}

fn parse_value(raw: &Value) -> Option<Option<f64>> {
    match raw {
        Value::Null => Some(None),
        Value::Number(number) => number.as_f64().filter(|v| v.is_finite()).map(Some),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Some(None);
            }
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Some)
        }
        _ => None,
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
