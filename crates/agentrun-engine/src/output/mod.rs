//! Output handling shared by every transport.
//!
//! Raw chunks are appended to the run's log file, normalized, deduplicated,
//! broadcast and finally scanned for subtask markers.

mod dedup;
mod pipeline;

pub use dedup::DedupCache;
pub(crate) use pipeline::OutputPipeline;
