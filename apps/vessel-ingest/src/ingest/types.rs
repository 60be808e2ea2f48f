use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const DAY_KEY_FORMAT: &str = "%Y%m%d";

/// Ordered by merge precedence: `Old < Today < New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Provenance {
    Old,
    Today,
    New,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Old => "old",
            Provenance::Today => "today",
            Provenance::New => "new",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalReading {
    pub vessel_id: String,
    pub signal_id: String,
    pub friendly_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    // `None` is a missing sample, never zero.
    pub value: Option<f64>,
    pub tag: Provenance,
}

impl SignalReading {
    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            vessel_id: self.vessel_id.clone(),
            signal_id: self.signal_id.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.value.is_none()
    }

    pub fn with_tag(mut self, tag: Provenance) -> Self {
        self.tag = tag;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadingKey {
    pub vessel_id: String,
    pub signal_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Closed interval `[gap_start, gap_end]` of consecutive missing samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub vessel_id: String,
    pub signal_id: String,
    pub gap_start: DateTime<Utc>,
    pub gap_end: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReading {
    pub vessel_id: String,
    pub signal_id: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub value: Option<f64>,
}

impl StoredReading {
    pub fn into_reading(self, tag: Provenance) -> SignalReading {
        SignalReading {
            vessel_id: self.vessel_id,
            signal_id: self.signal_id,
            friendly_name: self.friendly_name,
            timestamp: self.timestamp,
            value: self.value,
            tag,
        }
    }
}

impl From<&SignalReading> for StoredReading {
    fn from(reading: &SignalReading) -> Self {
        Self {
            vessel_id: reading.vessel_id.clone(),
            signal_id: reading.signal_id.clone(),
            friendly_name: reading.friendly_name.clone(),
            timestamp: reading.timestamp,
            value: reading.value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionEnvelope<T> {
    pub schema_version: u32,
    pub day: DayKey,
    pub written_at: DateTime<Utc>,
    #[serde(default = "Vec::new")]
    pub rows: Vec<T>,
}

#[derive(Debug, Error)]
#[error("invalid day key {raw:?}; expected YYYYMMDD")]
pub struct DayKeyError {
    raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub fn of(ts: DateTime<Utc>) -> Self {
        Self(ts.date_naive())
    }

    pub fn start(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.0.and_time(NaiveTime::MIN))
    }

    pub fn minus_days(&self, days: u32) -> Self {
        Self(
            self.0
                .checked_sub_days(Days::new(days as u64))
                .unwrap_or(NaiveDate::MIN),
        )
    }

    #[cfg(test)]
    pub fn plus_days(&self, days: u32) -> Self {
        Self(
            self.0
                .checked_add_days(Days::new(days as u64))
                .unwrap_or(NaiveDate::MAX),
        )
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DAY_KEY_FORMAT))
    }
}

impl FromStr for DayKey {
    type Err = DayKeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.len() != 8 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DayKeyError {
                raw: raw.to_string(),
            });
        }
        NaiveDate::parse_from_str(trimmed, DAY_KEY_FORMAT)
            .map(Self)
            .map_err(|_| DayKeyError {
                raw: raw.to_string(),
            })
    }
}

impl Serialize for DayKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DayKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
