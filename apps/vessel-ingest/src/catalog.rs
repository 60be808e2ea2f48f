use crate::ingest::store::{read_state_json, write_state_json, PartitionStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SIGNAL_MAPPING_STATE: &str = "signal_mapping";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRow {
    pub vessel_id: String,
    pub signal_id: String,
    pub friendly_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct SignalMapping {
    names: BTreeMap<(String, String), String>,
}

impl SignalMapping {
    pub fn load(store: &dyn PartitionStore) -> Result<Self, StoreError> {
        let rows: Vec<MappingRow> =
            read_state_json(store, SIGNAL_MAPPING_STATE)?.unwrap_or_default();
        Ok(Self::from_rows(rows))
    }

    pub fn save(&self, store: &dyn PartitionStore) -> Result<(), StoreError> {
        write_state_json(store, SIGNAL_MAPPING_STATE, &self.rows())
    }

    pub fn from_rows(rows: impl IntoIterator<Item = MappingRow>) -> Self {
        let names = rows
            .into_iter()
            .map(|row| ((row.vessel_id, row.signal_id), row.friendly_name))
            .collect();
        Self { names }
    }

    pub fn rows(&self) -> Vec<MappingRow> {
        self.names
            .iter()
            .map(|((vessel_id, signal_id), friendly_name)| MappingRow {
                vessel_id: vessel_id.clone(),
                signal_id: signal_id.clone(),
                friendly_name: friendly_name.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn absorb_catalog(&mut self, vessel_id: &str, payload: &Value) -> (usize, usize) {
        let Some(signals) = payload.get("signals").and_then(Value::as_object) else {
            tracing::warn!(vessel = %vessel_id, "signal catalog has no signals object");
            return (0, 0);
        };

        let mut added = 0;
        let mut renamed = 0;
        for (signal_id, meta) in signals {
            let Some(name) = meta
                .get("friendly_name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
            else {
                continue;
            };
            let key = (vessel_id.to_string(), signal_id.clone());
            match self.names.insert(key, name.to_string()) {
                None => added += 1,
                Some(previous) if previous != name => renamed += 1,
                Some(_) => {}
            }
        }
        (added, renamed)
    }

    pub fn friendly_name(&self, vessel_id: &str, signal_id: &str) -> Option<&str> {
        let exact = self
            .names
            .get(&(vessel_id.to_string(), signal_id.to_string()));
        exact
            .or_else(|| {
                self.names
                    .iter()
                    .find(|((_, signal), _)| signal == signal_id)
                    .map(|(_, name)| name)
            })
            .map(String::as_str)
    }
}
