//! Durable per-sample progress tracking.

mod record;
mod store;
mod tracker;

pub use record::{FieldUpdate, FieldValue, ProgressField, ProgressRecord};
pub use store::{FileProgressStore, MemoryProgressStore, ProgressStore};
pub use tracker::ProgressTracker;
