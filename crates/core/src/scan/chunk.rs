use std::collections::{BTreeMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cnf::SCAN_ID_OPTION;
use crate::kvs::KeyRange;

/// The configuration of one server-side filtering iterator
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IteratorSetting {
	pub priority: u32,
	pub name: String,
	pub class: String,
	pub options: BTreeMap<String, String>,
}

impl IteratorSetting {
	pub fn new(priority: u32, name: impl Into<String>, class: impl Into<String>) -> Self {
		Self {
			priority,
			name: name.into(),
			class: class.into(),
			options: BTreeMap::new(),
		}
	}

	pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.options.insert(key.into(), value.into());
		self
	}
}

/// The server-side iterator stack applied to every range of a chunk.
///
/// The scan layer never looks inside the settings, apart from tagging them
/// with the id of the physical scan which carries them.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ScanOptions {
	iterators: Vec<IteratorSetting>,
}

impl ScanOptions {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds an iterator, keeping the stack ordered by priority
	pub fn with_iterator(mut self, setting: IteratorSetting) -> Self {
		let at = self.iterators.partition_point(|s| s.priority <= setting.priority);
		self.iterators.insert(at, setting);
		self
	}

	pub fn iterators(&self) -> &[IteratorSetting] {
		&self.iterators
	}

	/// Returns a copy of these options with the scan id attached to every iterator
	pub fn with_scan_id(&self, id: &Uuid) -> Self {
		let mut out = self.clone();
		for setting in out.iterators.iter_mut() {
			setting.options.insert(SCAN_ID_OPTION.to_string(), id.to_string());
		}
		out
	}

	/// The scan id these options were tagged with, if any
	pub fn scan_id(&self) -> Option<&str> {
		self.iterators.first().and_then(|s| s.options.get(SCAN_ID_OPTION)).map(String::as_str)
	}
}

/// A unit of scan work: the ranges of one partition and how to filter them.
///
/// The range queue is consumed by the task which owns the chunk. Cloning a
/// chunk copies the queue, so that several tasks can race over the same
/// logical chunk without disturbing each other's progress. The iterator
/// configuration is an immutable snapshot shared by every clone.
#[derive(Clone, Debug)]
pub struct WorkChunk {
	query_id: String,
	table: String,
	auths: Arc<[String]>,
	ranges: VecDeque<KeyRange>,
	options: Arc<ScanOptions>,
	last_known_location: String,
	fingerprint: u64,
}

impl WorkChunk {
	pub fn new(
		query_id: impl Into<String>,
		table: impl Into<String>,
		ranges: impl IntoIterator<Item = KeyRange>,
		options: impl Into<Arc<ScanOptions>>,
		last_known_location: impl Into<String>,
	) -> Self {
		let mut ranges: Vec<KeyRange> = ranges.into_iter().collect();
		ranges.sort();
		let mut chunk = Self {
			query_id: query_id.into(),
			table: table.into(),
			auths: Arc::from(Vec::new()),
			ranges: ranges.into(),
			options: options.into(),
			last_known_location: last_known_location.into(),
			fingerprint: 0,
		};
		chunk.fingerprint = chunk.compute_fingerprint();
		chunk
	}

	// The identity of the chunk is fixed when it is planned, or rewritten by a visitor
	fn compute_fingerprint(&self) -> u64 {
		let mut hasher = DefaultHasher::new();
		self.options.hash(&mut hasher);
		self.ranges.hash(&mut hasher);
		self.last_known_location.hash(&mut hasher);
		hasher.finish()
	}

	/// Replaces the iterator configuration of every range
	pub fn with_options(mut self, options: impl Into<Arc<ScanOptions>>) -> Self {
		self.options = options.into();
		self.fingerprint = self.compute_fingerprint();
		self
	}

	/// Replaces the remaining ranges, which are scanned in sorted order
	pub fn with_ranges(mut self, ranges: impl IntoIterator<Item = KeyRange>) -> Self {
		let mut ranges: Vec<KeyRange> = ranges.into_iter().collect();
		ranges.sort();
		self.ranges = ranges.into();
		self.fingerprint = self.compute_fingerprint();
		self
	}

	/// Sets the authorizations the ranges are scanned with
	pub fn with_auths<I, S>(mut self, auths: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.auths = auths.into_iter().map(Into::into).collect();
		self
	}

	/// Removes and returns the first remaining range
	pub fn pop_next_range(&mut self) -> Option<KeyRange> {
		self.ranges.pop_front()
	}

	/// Puts a range back into the queue at its sorted position
	pub fn add_range(&mut self, range: KeyRange) {
		let at = self.ranges.partition_point(|r| r <= &range);
		self.ranges.insert(at, range);
	}

	pub fn ranges(&self) -> impl Iterator<Item = &KeyRange> {
		self.ranges.iter()
	}

	pub fn remaining(&self) -> usize {
		self.ranges.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ranges.is_empty()
	}

	pub fn query_id(&self) -> &str {
		&self.query_id
	}

	pub fn table(&self) -> &str {
		&self.table
	}

	pub fn auths(&self) -> &Arc<[String]> {
		&self.auths
	}

	pub fn options(&self) -> &Arc<ScanOptions> {
		&self.options
	}

	/// The server last known to host these ranges. This is only advisory.
	pub fn last_known_location(&self) -> &str {
		&self.last_known_location
	}

	pub fn set_last_known_location(&mut self, location: impl Into<String>) {
		self.last_known_location = location.into();
	}
}

impl PartialEq for WorkChunk {
	fn eq(&self, other: &Self) -> bool {
		self.fingerprint == other.fingerprint
			&& self.options == other.options
			&& self.last_known_location == other.last_known_location
	}
}

impl Eq for WorkChunk {}

impl Hash for WorkChunk {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.fingerprint.hash(state);
	}
}
