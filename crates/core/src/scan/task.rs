use std::sync::Arc;

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::stats::TimedOperation;
use super::{ResultSink, ScanSessionStats, WorkChunk};
use crate::cnf::SCAN_BATCH_SIZE;
use crate::err::{self, Error};
use crate::key::{Key, PartialKey};
use crate::kvs::{KeyRange, Keyed, ResourcePool, ResourceRequest, ResourceStrategy, ScanResource};

/// Builds the range which resumes a scan immediately after the last key emitted.
///
/// The continuation starts at the successor of `last_key` under the full key
/// ordering, inclusive, and ends where `previous` ends. When there is nothing
/// left of `previous` after `last_key` this fails with
/// [`Error::ContinuationPastEnd`], and when the successor would precede the
/// start of `previous` the continuation is malformed.
pub fn build_next_range(last_key: &Key, previous: &KeyRange) -> Result<KeyRange> {
	let start = last_key.following_key(PartialKey::RowColFamColQualColVisTime);
	if previous.before_start_key(&start) {
		bail!(Error::MalformedContinuation {
			key: start.to_string(),
			range: previous.to_string(),
		});
	}
	if previous.after_end_key(&start) {
		bail!(Error::ContinuationPastEnd {
			key: start.to_string(),
			range: previous.to_string(),
		});
	}
	KeyRange::new(Some(start), true, previous.end().cloned(), previous.is_end_inclusive())
}

/// Rewrites a chunk before any of it is scanned
pub type ChunkVisitor = Arc<dyn Fn(WorkChunk) -> Result<WorkChunk> + Send + Sync>;

/// The outcome of scanning one batch of one range
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Step {
	/// The batch completed, and the scan can carry on
	Advanced,
	/// The store timed out, and the remainder of the range was re-queued
	TimedOut,
	/// The scan was asked to stop
	Interrupted,
}

/// The state and protocol shared by every resumable scan.
///
/// A task walks the ranges of its [`WorkChunk`] in order, pulling at most one
/// batch per resource acquisition. It remembers the last key it emitted, so
/// that after a batch boundary or a store timeout the scan resumes strictly
/// after that key without skipping or repeating anything.
pub struct ScanTask<T> {
	chunk: WorkChunk,
	pool: Arc<dyn ResourcePool<T>>,
	sink: ResultSink<T>,
	cancel: CancellationToken,
	current_range: Option<KeyRange>,
	last_seen: Option<Key>,
	stats: ScanSessionStats,
	batch_size: usize,
	visitors: Vec<ChunkVisitor>,
	visited: bool,
}

impl<T> ScanTask<T>
where
	T: Keyed + Send + 'static,
{
	/// Creates a task which stops when `cancel`, or the task itself, is cancelled
	pub fn new(
		chunk: WorkChunk,
		pool: Arc<dyn ResourcePool<T>>,
		sink: ResultSink<T>,
		cancel: &CancellationToken,
	) -> Self {
		Self {
			chunk,
			pool,
			sink,
			cancel: cancel.child_token(),
			current_range: None,
			last_seen: None,
			stats: ScanSessionStats::new(),
			batch_size: *SCAN_BATCH_SIZE,
			visitors: Vec::new(),
			visited: false,
		}
	}

	pub fn set_batch_size(&mut self, batch_size: usize) {
		self.batch_size = batch_size.max(1);
	}

	/// Sets the visitors which rewrite the chunk, in order, before the first range is selected
	pub fn set_visitors(&mut self, visitors: Vec<ChunkVisitor>) {
		self.visitors = visitors;
	}

	/// Redirects the output of this task, and ties it to another cancellation token
	pub fn attach(&mut self, sink: ResultSink<T>, cancel: CancellationToken) {
		self.sink = sink;
		self.cancel = cancel;
	}

	pub fn chunk(&self) -> &WorkChunk {
		&self.chunk
	}

	pub fn stats(&self) -> &ScanSessionStats {
		&self.stats
	}

	pub fn current_range(&self) -> Option<&KeyRange> {
		self.current_range.as_ref()
	}

	pub fn last_seen_key(&self) -> Option<&Key> {
		self.last_seen.as_ref()
	}

	/// Whether the task was cancelled, or its consumer went away
	pub fn is_stopped(&self) -> bool {
		self.cancel.is_cancelled() || self.sink.is_closed()
	}

	/// Whether there is no more work for this task
	pub fn finished(&self) -> bool {
		self.is_stopped()
			|| (self.current_range.is_none() && self.last_seen.is_none() && self.chunk.is_empty())
	}

	pub fn close(&self) {
		self.cancel.cancel();
	}

	/// Applies the chunk visitors, once over the lifetime of the task
	pub(crate) fn visit(&mut self) -> Result<()> {
		if self.visited {
			return Ok(());
		}
		for visitor in &self.visitors {
			self.chunk = visitor(self.chunk.clone())?;
		}
		if !self.visitors.is_empty() {
			debug!(
				"Applied {} visitors to the chunk of query {}, leaving {} ranges",
				self.visitors.len(),
				self.chunk.query_id(),
				self.chunk.remaining()
			);
		}
		self.visited = true;
		Ok(())
	}

	/// Picks the range to scan next: the continuation of the current range if
	/// it is still in progress, otherwise the next range of the chunk.
	pub(crate) fn select_range(&mut self) -> Option<KeyRange> {
		if let (Some(last), Some(current)) = (&self.last_seen, &self.current_range) {
			let passed = current.end().is_some_and(|end| last >= end);
			if !passed {
				match build_next_range(last, current) {
					Ok(range) => {
						self.current_range = Some(range.clone());
						return Some(range);
					}
					Err(e) => match e.downcast_ref::<Error>() {
						Some(Error::ContinuationPastEnd {
							..
						}) => {
							trace!("Range {current} has no keys left after {last}");
						}
						_ => {
							warn!("Unable to continue range {current} after {last}: {e}");
						}
					},
				}
			}
		}
		self.last_seen = None;
		self.current_range = self.chunk.pop_next_range();
		if self.current_range.is_none() {
			trace!("Query {} has no more ranges to scan", self.chunk.query_id());
		}
		self.current_range.clone()
	}

	/// Prepares the request for one physical scan, under a fresh scan id
	pub(crate) fn request(&self, range: KeyRange, strategy: ResourceStrategy) -> ResourceRequest {
		let scan_id = Uuid::new_v4();
		ResourceRequest {
			table: self.chunk.table().to_string(),
			auths: self.chunk.auths().clone(),
			range,
			options: Arc::new(self.chunk.options().with_scan_id(&scan_id)),
			strategy,
			batch_size: self.batch_size,
			timeout: None,
			location: self.chunk.last_known_location().to_string(),
			scan_id,
		}
	}

	/// Puts the current range back onto the chunk untouched
	pub(crate) fn requeue_current(&mut self) {
		self.last_seen = None;
		if let Some(range) = self.current_range.take() {
			self.chunk.add_range(range);
		}
	}

	/// Puts whatever has not been scanned of the current range back onto the chunk
	fn requeue_remainder(&mut self) {
		let Some(range) = self.current_range.take() else {
			return;
		};
		match self.last_seen.take() {
			None => self.chunk.add_range(range),
			Some(last) => match build_next_range(&last, &range) {
				Ok(remainder) => self.chunk.add_range(remainder),
				Err(e) => trace!("Nothing of {range} remains to be re-queued: {e}"),
			},
		}
	}

	/// Acquires a resource for the request and scans one batch from it
	pub(crate) async fn execute(&mut self, request: ResourceRequest) -> Result<Step> {
		trace!(
			"Scanning {} of table {} with scan id {} using the {} strategy",
			request.range,
			request.table,
			request.scan_id,
			request.strategy
		);
		self.stats.acquisitions += 1;
		self.stats.resume(TimedOperation::ScannerStart);
		let acquired = self.pool.acquire(request).await;
		self.stats.suspend(TimedOperation::ScannerStart);
		let mut resource = match acquired {
			Ok(resource) => resource,
			Err(e) => return self.recover(e),
		};
		self.stats.resume(TimedOperation::ScannerIterate);
		let res = self.drain(resource.as_mut()).await;
		self.stats.suspend(TimedOperation::ScannerIterate);
		// The resource is never held across a continuation
		self.pool.release(resource);
		match res {
			Ok(()) => Ok(Step::Advanced),
			Err(e) => self.recover(e),
		}
	}

	async fn drain(&mut self, resource: &mut dyn ScanResource<T>) -> Result<()> {
		let mut count = 0;
		while count < self.batch_size {
			let Some(item) = resource.next().await? else {
				break;
			};
			let key = item.key().clone();
			self.sink.offer(item, &self.cancel, &mut self.stats).await?;
			self.last_seen = Some(key);
			self.stats.keys_seen += 1;
			count += 1;
		}
		// A short batch means the range is exhausted
		if count < self.batch_size {
			self.last_seen = None;
			self.stats.ranges_scanned += 1;
		}
		Ok(())
	}

	fn recover(&mut self, err: anyhow::Error) -> Result<Step> {
		if err::is_timeout(&err) {
			self.stats.timeouts += 1;
			debug!("Scan of query {} was time-sliced: {err}", self.chunk.query_id());
			self.requeue_remainder();
			return Ok(Step::TimedOut);
		}
		if err::is_interrupted(&err) {
			info!("Scan of query {} was interrupted: {err}", self.chunk.query_id());
			return Ok(Step::Interrupted);
		}
		error!("Scan of query {} failed: {err}", self.chunk.query_id());
		Err(err)
	}
}

impl<T> Clone for ScanTask<T> {
	/// Clones the task with an independent copy of its progress
	fn clone(&self) -> Self {
		Self {
			chunk: self.chunk.clone(),
			pool: self.pool.clone(),
			sink: self.sink.clone(),
			cancel: self.cancel.clone(),
			current_range: self.current_range.clone(),
			last_seen: self.last_seen.clone(),
			stats: self.stats.clone(),
			batch_size: self.batch_size,
			visitors: self.visitors.clone(),
			visited: self.visited,
		}
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;
	use crate::kvs::Entry;
	use crate::kvs::mem::MemStore;
	use crate::scan::ScanOptions;

	#[rstest]
	#[case::within_a_row(Key::new("f", "cf", "cq", "", 10))]
	#[case::oldest_version(Key::new("f", "cf", "cq", "vis", i64::MIN))]
	#[case::bare_row(Key::row("f"))]
	fn continuation_starts_strictly_after_the_last_key(#[case] last: Key) {
		let previous = KeyRange::rows("a", "m").unwrap();
		let next = build_next_range(&last, &previous).unwrap();
		let start = next.start().unwrap();
		assert!(start > &last);
		assert!(next.is_start_inclusive());
		assert!(!next.contains(&last));
		assert_eq!(next.end(), previous.end());
		assert_eq!(next.is_end_inclusive(), previous.is_end_inclusive());
	}

	#[test]
	fn continuation_keeps_an_unbounded_end() {
		let next = build_next_range(&Key::row("q"), &KeyRange::all()).unwrap();
		assert!(next.end().is_none());
		assert!(next.contains(&Key::row("z")));
	}

	#[test]
	fn continuation_past_the_end_is_rejected() {
		let previous = KeyRange::new(Some(Key::row("a")), true, Some(Key::row("m")), true).unwrap();
		let err = build_next_range(&Key::row("m"), &previous).unwrap_err();
		assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ContinuationPastEnd { .. })));
	}

	async fn drive(task: &mut ScanTask<Entry>) -> Result<()> {
		task.visit()?;
		while let Some(range) = task.select_range() {
			let request = task.request(range, ResourceStrategy::Batch);
			task.execute(request).await?;
		}
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn a_malformed_continuation_falls_back_to_the_next_range() {
		let store = MemStore::new();
		for row in ["b", "d", "n", "q"] {
			store.put("t", Key::new(row, "cf", "cq", "", 1), row);
		}
		let store = Arc::new(store);
		let chunk = WorkChunk::new("q-1", "t", [KeyRange::rows("a", "m").unwrap()], ScanOptions::new(), "mem");
		let (sink, rx) = ResultSink::bounded(10);
		let mut task: ScanTask<Entry> = ScanTask::new(chunk, store.clone(), sink, &CancellationToken::new());
		// The last key sorts before the start of the range it claims to continue
		task.current_range = Some(KeyRange::rows("m", "z").unwrap());
		task.last_seen = Some(Key::row("f"));
		drive(&mut task).await.unwrap();
		assert!(task.finished());
		assert!(task.last_seen_key().is_none());
		let requests = store.requests();
		assert_eq!(requests.len(), 1);
		assert_eq!(requests[0].range, KeyRange::rows("a", "m").unwrap());
		let mut rows = Vec::new();
		while let Ok(entry) = rx.try_recv() {
			rows.push(entry.key.row);
		}
		assert_eq!(rows, vec![b"b".to_vec(), b"d".to_vec()]);
	}

	#[test]
	fn continuation_before_the_start_is_malformed() {
		let previous = KeyRange::rows("m", "z").unwrap();
		let err = build_next_range(&Key::row("f"), &previous).unwrap_err();
		assert!(matches!(err.downcast_ref::<Error>(), Some(Error::MalformedContinuation { .. })));
	}
}
