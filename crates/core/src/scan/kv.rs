use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::task::{ChunkVisitor, Step};
use super::{
	ResultSink, ScanAttempt, ScanSessionStats, ScanTask, ScanWork, WorkChunk, is_single_record_range,
};
use crate::kvs::{Entry, ResourcePool, ResourceStrategy};

/// A resumable scan which streams the raw entries of a chunk.
///
/// Each call to [`Scan::run`] walks the chunk's ranges in order until they
/// are exhausted, the store times out, or the scan is cancelled. After a
/// timeout the unscanned remainder of the range is put back onto the chunk,
/// so that the next call carries on exactly where this one stopped.
#[derive(Clone)]
pub struct Scan {
	task: ScanTask<Entry>,
	/// Overrides the strategy of single-record ranges
	strategy: Option<ResourceStrategy>,
}

impl Scan {
	pub fn new(
		chunk: WorkChunk,
		pool: Arc<dyn ResourcePool<Entry>>,
		sink: ResultSink<Entry>,
		cancel: &CancellationToken,
	) -> Self {
		Self {
			task: ScanTask::new(chunk, pool, sink, cancel),
			strategy: None,
		}
	}

	/// Limits how many entries are pulled from a single resource acquisition
	pub fn with_batch_size(mut self, batch_size: usize) -> Self {
		self.task.set_batch_size(batch_size);
		self
	}

	/// Pins the strategy used for single-record ranges. Spans of rows always use
	/// [`ResourceStrategy::Batch`].
	pub fn with_strategy(mut self, strategy: ResourceStrategy) -> Self {
		self.strategy = Some(strategy);
		self
	}

	/// Rewrites the chunk with each visitor before the scan starts
	pub fn with_visitors(mut self, visitors: Vec<ChunkVisitor>) -> Self {
		self.task.set_visitors(visitors);
		self
	}

	pub fn task(&self) -> &ScanTask<Entry> {
		&self.task
	}

	pub fn chunk(&self) -> &WorkChunk {
		self.task.chunk()
	}

	pub fn stats(&self) -> &ScanSessionStats {
		self.task.stats()
	}

	pub fn finished(&self) -> bool {
		self.task.finished()
	}

	/// Stops this scan at its next suspension point
	pub fn close(&self) {
		self.task.close()
	}

	/// Scans until the chunk is exhausted, the store times out, or the scan is stopped
	#[instrument(level = "debug", target = "tabletscan::core::scan", skip(self), fields(query = self.task.chunk().query_id(), location = self.task.chunk().last_known_location()))]
	pub async fn run(&mut self) -> Result<()> {
		self.task.visit()?;
		loop {
			if self.task.is_stopped() {
				return Ok(());
			}
			let Some(range) = self.task.select_range() else {
				return Ok(());
			};
			let strategy = match self.strategy {
				Some(strategy) if is_single_record_range(&range) => strategy,
				_ => ResourceStrategy::for_range(&range),
			};
			let request = self.task.request(range, strategy);
			match self.task.execute(request).await? {
				Step::Advanced => (),
				Step::TimedOut | Step::Interrupted => return Ok(()),
			}
			if self.task.finished() {
				return Ok(());
			}
		}
	}
}

#[async_trait]
impl ScanWork for Scan {
	async fn call(mut self) -> Result<Self> {
		self.run().await?;
		Ok(self)
	}

	fn finished(&self) -> bool {
		self.task.finished()
	}
}

#[async_trait]
impl ScanAttempt<Entry> for Scan {
	fn attach(&mut self, sink: ResultSink<Entry>, cancel: CancellationToken) {
		self.task.attach(sink, cancel)
	}

	async fn run(&mut self) -> Result<()> {
		Scan::run(self).await
	}

	fn chunk(&self) -> &WorkChunk {
		self.task.chunk()
	}

	fn finished(&self) -> bool {
		self.task.finished()
	}

	fn close(&self) {
		self.task.close()
	}
}
