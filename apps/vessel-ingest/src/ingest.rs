mod gaps;
mod merge;
mod rolling;
pub mod store;
mod types;
mod window;

#[cfg(test)]
mod tests;

pub use gaps::GapDetector;
pub use merge::ReconciliationMerger;
pub use rolling::{load_reference_readings, ReferenceWindow, ReferenceWindowRotator, RotationOutcome};
pub use store::{DailySummaryStore, Dataset, FsPartitionStore, GapStore, PartitionStore};
pub use types::{DayKey, Provenance, SignalReading};
pub use window::{FetchWindow, FetchWindowPlanner, PersistedWatermarks};
