//! The seam between the scan layer and the store.
//!
//! A [`ResourcePool`] hands out [`ScanResource`]s scoped to one range of one
//! table. The scan layer holds a resource only for a single batch of a single
//! range and hands it back with [`ResourcePool::release`] before acquiring
//! another.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use super::KeyRange;
use crate::key::Key;
use crate::scan::{ScanOptions, is_single_record_range};

/// A scan result which is positioned at a key of the store
pub trait Keyed {
	/// The key used to resume scanning after this result
	fn key(&self) -> &Key;
}

/// A raw key-value pair
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
	pub key: Key,
	pub value: Bytes,
}

impl Entry {
	pub fn new(key: Key, value: impl Into<Bytes>) -> Self {
		Self {
			key,
			value: value.into(),
		}
	}
}

impl Keyed for Entry {
	fn key(&self) -> &Key {
		&self.key
	}
}

/// A record which the server has already aggregated from its entries
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Document {
	/// The last key of the record, so that resuming skips the whole record
	pub key: Key,
	pub entries: Vec<Entry>,
}

impl Document {
	/// The row and column family which identify this record
	pub fn id(&self) -> (&[u8], &[u8]) {
		(&self.key.row, &self.key.column_family)
	}
}

impl Keyed for Document {
	fn key(&self) -> &Key {
		&self.key
	}
}

/// How a resource is initialised on the server side
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ResourceStrategy {
	/// Optimised for streaming through spans of rows or shards
	Batch,
	/// Optimised for fetching a single record
	PointLookup,
}

impl ResourceStrategy {
	/// Picks the strategy which suits the shape of a range
	pub fn for_range(range: &KeyRange) -> Self {
		if is_single_record_range(range) {
			Self::PointLookup
		} else {
			Self::Batch
		}
	}
}

impl fmt::Display for ResourceStrategy {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Batch => f.write_str("batch"),
			Self::PointLookup => f.write_str("point-lookup"),
		}
	}
}

/// Everything a pool needs to open a resource for one physical scan
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ResourceRequest {
	pub table: String,
	pub auths: Arc<[String]>,
	pub range: KeyRange,
	/// The iterator configuration, tagged with `scan_id`
	pub options: Arc<ScanOptions>,
	pub strategy: ResourceStrategy,
	/// The maximum number of results a single acquisition yields
	pub batch_size: usize,
	/// A server-side time limit, if one was granted by an admission gate
	pub timeout: Option<Duration>,
	/// The last known server for this range
	pub location: String,
	pub scan_id: Uuid,
}

/// A resource which yields the results of one range, in key order
#[async_trait]
pub trait ScanResource<T>: Send {
	/// Returns the next result, or `None` once this acquisition is exhausted.
	///
	/// A store-level timeout is reported as [`Error::ScanTimedout`](crate::err::Error).
	async fn next(&mut self) -> Result<Option<T>>;
}

/// A source of pooled scan resources
#[async_trait]
pub trait ResourcePool<T>: Send + Sync {
	/// Waits for a free resource and opens it for the request
	async fn acquire(&self, request: ResourceRequest) -> Result<Box<dyn ScanResource<T>>>;

	/// Hands a resource back to the pool
	fn release(&self, resource: Box<dyn ScanResource<T>>) {
		drop(resource)
	}
}
