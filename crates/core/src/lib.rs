//! # Tabletscan Core
//!
//! The client-side scan layer of a query tier that reads from a
//! range-partitioned, sorted key-value store. Work is handed out as
//! [`WorkChunk`](scan::WorkChunk)s, each a queue of key ranges plus the
//! server-side iterator configuration for one partition. A chunk is walked by
//! a [`Scan`](scan::Scan) or a [`DocumentScan`](scan::DocumentScan), which
//! resume after store timeouts without skipping or repeating keys, and can be
//! raced against alternative strategies with a
//! [`SpeculativeScan`](scan::SpeculativeScan) which commits exactly one
//! winner's output.

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod cnf;
pub mod err;
pub mod key;
pub mod kvs;
pub mod scan;

/// Channels for receiving the results of a scan
pub mod channel {
	pub use async_channel::Receiver;
	pub use async_channel::Sender;
	pub use async_channel::bounded;
	pub use async_channel::unbounded;
}
