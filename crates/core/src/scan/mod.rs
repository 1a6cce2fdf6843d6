//! The scan execution layer.
//!
//! A [`WorkChunk`] is scanned by a [`Scan`], which streams raw entries, or by
//! a [`DocumentScan`], which streams documents aggregated by the server. Both
//! share the resumable protocol of [`ScanTask`]. Either can be raced against
//! alternatives with a [`SpeculativeScan`], and any of them can be run to
//! completion on a [`WorkerPool`].
mod chunk;
mod classify;
mod document;
mod gate;
mod kv;
mod pool;
mod sink;
mod speculative;
mod stats;
mod task;

pub use chunk::{IteratorSetting, ScanOptions, WorkChunk};
pub use classify::{all_single_record, is_single_record_range};
pub use document::DocumentScan;
pub use gate::{AdmissionGate, ServerHealthGate};
pub use kv::Scan;
pub use pool::{ScanWork, WorkerPool};
pub use sink::ResultSink;
pub use speculative::{AttemptId, ScanAttempt, SpeculativeScan};
pub use stats::{ScanSessionStats, TimedOperation};
pub use task::{ChunkVisitor, ScanTask, build_next_range};
