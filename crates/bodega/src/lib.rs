mod clock;
mod item;
mod settings;
mod stats;
mod store;

pub use clock::{Clock, RelTime};
pub use item::{Item, size_class};
pub use settings::Settings;
pub use stats::{GlobalStats, Stats, StatsSnapshot, WorkerStats};
pub use store::{DeltaError, DeltaOp, ItemStore, StoreError, StoreOutcome, StoreVerb};

/// Highest size class id the per-class statistics track. Classifier output
/// is clamped to this.
pub const MAX_SIZE_CLASSES: usize = 64;
