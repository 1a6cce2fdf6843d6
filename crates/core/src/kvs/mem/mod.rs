//! An in-memory sorted store.
//!
//! The store keeps one sorted map per table, and serves both raw entries and
//! documents through the [`ResourcePool`] seam. Handles created with
//! [`MemStore::with_faults`] share the same data but inject timeouts, delays,
//! or failures into the resources they hand out. Every request served is
//! recorded, so that the scan layer's behaviour can be inspected.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::cnf::RESOURCE_POOL_SIZE;
use crate::err::Error;
use crate::key::Key;
use crate::kvs::{Document, Entry, KeyRange, ResourcePool, ResourceRequest, ScanResource};

/// Faults to inject into the resources handed out by a store
#[derive(Clone, Debug, Default)]
pub struct Faults {
	timeouts: VecDeque<usize>,
	delay: Duration,
	failure: Option<String>,
}

impl Faults {
	/// Makes consecutive acquisitions time out after the given numbers of results
	pub fn timeout_after(mut self, schedule: impl IntoIterator<Item = usize>) -> Self {
		self.timeouts.extend(schedule);
		self
	}

	/// Delays every acquisition and every result
	pub fn delay(mut self, delay: Duration) -> Self {
		self.delay = delay;
		self
	}

	/// Makes every acquisition fail
	pub fn fail(mut self, message: impl Into<String>) -> Self {
		self.failure = Some(message.into());
		self
	}
}

type Tables = HashMap<String, BTreeMap<Key, Bytes>>;

#[derive(Default)]
struct Tracker {
	requests: Mutex<Vec<ResourceRequest>>,
	releases: AtomicUsize,
	open: AtomicUsize,
	peak: AtomicUsize,
}

pub struct MemStore {
	tables: Arc<RwLock<Tables>>,
	permits: Arc<Semaphore>,
	tracker: Arc<Tracker>,
	faults: Mutex<Faults>,
}

impl Default for MemStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemStore {
	pub fn new() -> Self {
		Self::with_capacity(*RESOURCE_POOL_SIZE)
	}

	/// Creates a store which hands out at most `resources` resources at once
	pub fn with_capacity(resources: usize) -> Self {
		Self {
			tables: Arc::new(RwLock::new(HashMap::new())),
			permits: Arc::new(Semaphore::new(resources.max(1))),
			tracker: Arc::new(Tracker::default()),
			faults: Mutex::new(Faults::default()),
		}
	}

	/// Returns a handle onto the same data, which injects the given faults
	pub fn with_faults(&self, faults: Faults) -> Self {
		Self {
			tables: self.tables.clone(),
			permits: self.permits.clone(),
			tracker: self.tracker.clone(),
			faults: Mutex::new(faults),
		}
	}

	pub fn put(&self, table: &str, key: Key, value: impl Into<Bytes>) {
		self.tables.write().entry(table.to_string()).or_default().insert(key, value.into());
	}

	/// The number of entries stored in a table
	pub fn len(&self, table: &str) -> usize {
		self.tables.read().get(table).map(BTreeMap::len).unwrap_or_default()
	}

	/// Every request served so far, in order
	pub fn requests(&self) -> Vec<ResourceRequest> {
		self.tracker.requests.lock().clone()
	}

	/// The number of resources handed back to the store
	pub fn releases(&self) -> usize {
		self.tracker.releases.load(Ordering::SeqCst)
	}

	/// The largest number of resources which were open at the same time
	pub fn peak_open(&self) -> usize {
		self.tracker.peak.load(Ordering::SeqCst)
	}

	/// Takes a snapshot of the visible entries of a range
	fn snapshot(&self, table: &str, range: &KeyRange, auths: &[String]) -> Vec<Entry> {
		let tables = self.tables.read();
		let Some(map) = tables.get(table) else {
			return Vec::new();
		};
		let lower = match range.start() {
			None => Bound::Unbounded,
			Some(k) if range.is_start_inclusive() => Bound::Included(k.clone()),
			Some(k) => Bound::Excluded(k.clone()),
		};
		map.range((lower, Bound::Unbounded))
			.take_while(|(k, _)| !range.after_end_key(k))
			.filter(|(k, _)| visible(k, auths))
			.map(|(k, v)| Entry::new(k.clone(), v.clone()))
			.collect()
	}

	async fn open<T, F>(&self, request: ResourceRequest, build: F) -> Result<Box<dyn ScanResource<T>>>
	where
		T: Send + 'static,
		F: FnOnce(Vec<Entry>) -> Vec<T>,
	{
		// Wait for a free resource
		let Ok(permit) = self.permits.clone().acquire_owned().await else {
			bail!(Error::Ds("The store has been closed".into()));
		};
		// Record the request
		self.tracker.requests.lock().push(request.clone());
		// Apply any injected faults
		let (timeout_after, delay, failure) = {
			let mut faults = self.faults.lock();
			(faults.timeouts.pop_front(), faults.delay, faults.failure.clone())
		};
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		if let Some(message) = failure {
			bail!(Error::Ds(message));
		}
		// Take a snapshot of the range
		let items = build(self.snapshot(&request.table, &request.range, &request.auths));
		let open = self.tracker.open.fetch_add(1, Ordering::SeqCst) + 1;
		self.tracker.peak.fetch_max(open, Ordering::SeqCst);
		Ok(Box::new(MemResource {
			items: items.into(),
			served: 0,
			timeout_after,
			delay,
			location: request.location,
			tracker: self.tracker.clone(),
			_permit: permit,
		}))
	}
}

fn visible(key: &Key, auths: &[String]) -> bool {
	key.visibility.is_empty() || auths.iter().any(|a| a.as_bytes() == key.visibility.as_slice())
}

/// Groups sorted entries into one document per row and column family
fn documents(entries: Vec<Entry>) -> Vec<Document> {
	let mut out: Vec<Document> = Vec::new();
	for entry in entries {
		match out.last_mut() {
			Some(doc)
				if doc.key.row == entry.key.row
					&& doc.key.column_family == entry.key.column_family =>
			{
				doc.key = entry.key.clone();
				doc.entries.push(entry);
			}
			_ => out.push(Document {
				key: entry.key.clone(),
				entries: vec![entry],
			}),
		}
	}
	out
}

struct MemResource<T> {
	items: VecDeque<T>,
	served: usize,
	timeout_after: Option<usize>,
	delay: Duration,
	location: String,
	tracker: Arc<Tracker>,
	_permit: OwnedSemaphorePermit,
}

impl<T> Drop for MemResource<T> {
	fn drop(&mut self) {
		self.tracker.open.fetch_sub(1, Ordering::SeqCst);
	}
}

#[async_trait]
impl<T: Send + 'static> ScanResource<T> for MemResource<T> {
	async fn next(&mut self) -> Result<Option<T>> {
		if !self.delay.is_zero() {
			tokio::time::sleep(self.delay).await;
		}
		if self.timeout_after == Some(self.served) {
			bail!(Error::ScanTimedout {
				location: self.location.clone(),
			});
		}
		self.served += 1;
		Ok(self.items.pop_front())
	}
}

#[async_trait]
impl ResourcePool<Entry> for MemStore {
	async fn acquire(&self, request: ResourceRequest) -> Result<Box<dyn ScanResource<Entry>>> {
		self.open(request, |entries| entries).await
	}

	fn release(&self, resource: Box<dyn ScanResource<Entry>>) {
		self.tracker.releases.fetch_add(1, Ordering::SeqCst);
		drop(resource)
	}
}

#[async_trait]
impl ResourcePool<Document> for MemStore {
	async fn acquire(&self, request: ResourceRequest) -> Result<Box<dyn ScanResource<Document>>> {
		self.open(request, documents).await
	}

	fn release(&self, resource: Box<dyn ScanResource<Document>>) {
		self.tracker.releases.fetch_add(1, Ordering::SeqCst);
		drop(resource)
	}
}
