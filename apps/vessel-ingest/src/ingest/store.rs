use super::types::{DayKey, Gap, PartitionEnvelope, Provenance, SignalReading, StoredReading};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const PARTITION_SCHEMA_VERSION: u32 = 1;
const STATE_DIR: &str = "_state";
const PARTITION_EXTENSION: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dataset {
    DailySummary,
    Gaps,
}

impl Dataset {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Dataset::DailySummary => "daily_summary",
            Dataset::Gaps => "gaps",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt {what}: {source}")]
    Corrupt {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

/// `write_partition` and `write_state` must be atomic: a reader sees the
/// previous content or the new content, never a truncated mix.
pub trait PartitionStore: Send + Sync {
    fn read_partition(&self, dataset: Dataset, day: DayKey) -> Result<Option<Vec<u8>>, StoreError>;
    fn write_partition(&self, dataset: Dataset, day: DayKey, bytes: &[u8])
        -> Result<(), StoreError>;
    fn delete_partition(&self, dataset: Dataset, day: DayKey) -> Result<bool, StoreError>;
    fn partition_exists(&self, dataset: Dataset, day: DayKey) -> Result<bool, StoreError>;
    fn list_partitions(&self, dataset: Dataset) -> Result<Vec<DayKey>, StoreError>;
    fn read_state(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn write_state(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FsPartitionStore {
    root: PathBuf,
}

impl FsPartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dataset_dir(&self, dataset: Dataset) -> PathBuf {
        self.root.join(dataset.dir_name())
    }

    pub fn partition_path(&self, dataset: Dataset, day: DayKey) -> PathBuf {
        self.dataset_dir(dataset)
            .join(format!("{day}.{PARTITION_EXTENSION}"))
    }

    pub fn state_path(&self, name: &str) -> PathBuf {
        self.root
            .join(STATE_DIR)
            .join(format!("{name}.{PARTITION_EXTENSION}"))
    }
}

impl PartitionStore for FsPartitionStore {
    fn read_partition(&self, dataset: Dataset, day: DayKey) -> Result<Option<Vec<u8>>, StoreError> {
        read_optional(&self.partition_path(dataset, day))
    }

    fn write_partition(
        &self,
        dataset: Dataset,
        day: DayKey,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        write_atomic(&self.partition_path(dataset, day), bytes)
    }

    fn delete_partition(&self, dataset: Dataset, day: DayKey) -> Result<bool, StoreError> {
        let path = self.partition_path(dataset, day);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn partition_exists(&self, dataset: Dataset, day: DayKey) -> Result<bool, StoreError> {
        let path = self.partition_path(dataset, day);
        path.try_exists()
            .map_err(|source| StoreError::Io { path, source })
    }

    fn list_partitions(&self, dataset: Dataset) -> Result<Vec<DayKey>, StoreError> {
        let dir = self.dataset_dir(dataset);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut days = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|v| v.to_str()) != Some(PARTITION_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|v| v.to_str()) else {
                continue;
            };
            match stem.parse::<DayKey>() {
                Ok(day) => days.push(day),
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "skipping non-partition file");
                }
            }
        }
        days.sort();
        days.dedup();
        Ok(days)
    }

    fn read_state(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        read_optional(&self.state_path(name))
    }

    fn write_state(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        write_atomic(&self.state_path(name), bytes)
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// Temp file next to the target, fsync, then rename over it.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |at: &Path| {
        let at = at.to_path_buf();
        move |source: io::Error| StoreError::Io { path: at, source }
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err(parent))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err(parent))?;
    tmp.write_all(bytes).map_err(io_err(tmp.path()))?;
    tmp.flush().map_err(io_err(path))?;
    tmp.as_file().sync_all().map_err(io_err(path))?;
    tmp.persist(path).map_err(|err| StoreError::Io {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}

fn encode_partition<T: Serialize>(
    dataset: Dataset,
    day: DayKey,
    rows: Vec<T>,
    written_at: DateTime<Utc>,
) -> Result<Vec<u8>, StoreError> {
    let envelope = PartitionEnvelope {
        schema_version: PARTITION_SCHEMA_VERSION,
        day,
        written_at,
        rows,
    };
    serde_json::to_vec(&envelope).map_err(|source| StoreError::Encode {
        what: format!("{} partition {day}", dataset.dir_name()),
        source,
    })
}

fn decode_partition<T: DeserializeOwned>(
    dataset: Dataset,
    day: DayKey,
    bytes: &[u8],
) -> Result<Vec<T>, StoreError> {
    let envelope: PartitionEnvelope<T> =
        serde_json::from_slice(bytes).map_err(|source| StoreError::Corrupt {
            what: format!("{} partition {day}", dataset.dir_name()),
            source,
        })?;
    if envelope.day != day {
        tracing::warn!(
            dataset = dataset.dir_name(),
            requested = %day,
            stored = %envelope.day,
            "partition envelope day does not match its file name"
        );
    }
    Ok(envelope.rows)
}

pub fn read_state_json<T: DeserializeOwned>(
    store: &dyn PartitionStore,
    name: &str,
) -> Result<Option<T>, StoreError> {
    let Some(bytes) = store.read_state(name)? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            what: format!("state {name}"),
            source,
        })
}

pub fn write_state_json<T: Serialize>(
    store: &dyn PartitionStore,
    name: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        what: format!("state {name}"),
        source,
    })?;
    store.write_state(name, &bytes)
}

#[derive(Clone, Copy)]
pub struct DailySummaryStore<'a> {
    store: &'a dyn PartitionStore,
}

impl<'a> DailySummaryStore<'a> {
    pub fn new(store: &'a dyn PartitionStore) -> Self {
        Self { store }
    }

    pub fn exists(&self, day: DayKey) -> Result<bool, StoreError> {
        self.store.partition_exists(Dataset::DailySummary, day)
    }

    pub fn read(&self, day: DayKey, tag: Provenance) -> Result<Vec<SignalReading>, StoreError> {
        let Some(bytes) = self.store.read_partition(Dataset::DailySummary, day)? else {
            return Ok(Vec::new());
        };
        let rows: Vec<StoredReading> = decode_partition(Dataset::DailySummary, day, &bytes)?;
        Ok(rows.into_iter().map(|row| row.into_reading(tag)).collect())
    }

    pub fn write(
        &self,
        day: DayKey,
        readings: &[SignalReading],
        written_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let rows: Vec<StoredReading> = readings.iter().map(StoredReading::from).collect();
        let bytes = encode_partition(Dataset::DailySummary, day, rows, written_at)?;
        self.store
            .write_partition(Dataset::DailySummary, day, &bytes)?;
        tracing::debug!(day = %day, rows = readings.len(), "daily summary written");
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub struct GapStore<'a> {
    store: &'a dyn PartitionStore,
}

impl<'a> GapStore<'a> {
    pub fn new(store: &'a dyn PartitionStore) -> Self {
        Self { store }
    }

    #[cfg(test)]
    pub fn read(&self, day: DayKey) -> Result<Vec<Gap>, StoreError> {
        let Some(bytes) = self.store.read_partition(Dataset::Gaps, day)? else {
            return Ok(Vec::new());
        };
        decode_partition(Dataset::Gaps, day, &bytes)
    }

    pub fn write(
        &self,
        day: DayKey,
        gaps: &[Gap],
        written_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let bytes = encode_partition(Dataset::Gaps, day, gaps.to_vec(), written_at)?;
        self.store.write_partition(Dataset::Gaps, day, &bytes)
    }
}
