use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::task::{ChunkVisitor, Step};
use super::{
	AdmissionGate, ResultSink, ScanAttempt, ScanSessionStats, ScanTask, ScanWork, WorkChunk,
	is_single_record_range,
};
use crate::kvs::{Document, ResourcePool, ResourceStrategy};

/// A resumable scan which streams documents aggregated by the server.
///
/// It follows the same protocol as [`Scan`](super::Scan), with two
/// differences. Single-record ranges are only scanned once the admission
/// gate, if there is one, agrees, and they then carry the gate's time limit.
/// Batch ranges always use the batch strategy, whatever strategy the caller
/// asked for.
#[derive(Clone)]
pub struct DocumentScan {
	task: ScanTask<Document>,
	gate: Option<Arc<dyn AdmissionGate>>,
	gate_timeout: Duration,
	strategy: ResourceStrategy,
	deferred: bool,
}

impl DocumentScan {
	pub fn new(
		chunk: WorkChunk,
		pool: Arc<dyn ResourcePool<Document>>,
		sink: ResultSink<Document>,
		cancel: &CancellationToken,
	) -> Self {
		Self {
			task: ScanTask::new(chunk, pool, sink, cancel),
			gate: None,
			gate_timeout: Duration::ZERO,
			strategy: ResourceStrategy::PointLookup,
			deferred: false,
		}
	}

	/// Consults the gate before single-record scans, which are then limited to `timeout`.
	///
	/// A zero timeout leaves the gate in place for reporting, but never asks it.
	pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>, timeout: Duration) -> Self {
		self.gate = Some(gate);
		self.gate_timeout = timeout;
		self
	}

	/// Sets the strategy used for single-record ranges
	pub fn with_strategy(mut self, strategy: ResourceStrategy) -> Self {
		self.strategy = strategy;
		self
	}

	pub fn with_batch_size(mut self, batch_size: usize) -> Self {
		self.task.set_batch_size(batch_size);
		self
	}

	/// Rewrites the chunk with each visitor before the scan starts
	pub fn with_visitors(mut self, visitors: Vec<ChunkVisitor>) -> Self {
		self.task.set_visitors(visitors);
		self
	}

	pub fn task(&self) -> &ScanTask<Document> {
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

	/// Whether the last run was refused by the admission gate
	pub fn deferred(&self) -> bool {
		self.deferred
	}

	pub fn close(&self) {
		self.task.close()
	}

	#[instrument(level = "debug", target = "tabletscan::core::scan::document", skip(self), fields(query = self.task.chunk().query_id(), location = self.task.chunk().last_known_location()))]
	pub async fn run(&mut self) -> Result<()> {
		self.deferred = false;
		self.task.visit()?;
		loop {
			if self.task.is_stopped() {
				return Ok(());
			}
			let Some(range) = self.task.select_range() else {
				return Ok(());
			};
			let single = is_single_record_range(&range);
			let strategy = if single {
				self.strategy
			} else {
				ResourceStrategy::Batch
			};
			let mut request = self.task.request(range, strategy);
			if single && !self.gate_timeout.is_zero() {
				if let Some(gate) = &self.gate {
					if !gate.can_run(self.task.chunk()) {
						debug!("Deferring single-record scan for query {}", self.task.chunk().query_id());
						self.task.requeue_current();
						self.deferred = true;
						return Ok(());
					}
					request.timeout = Some(self.gate_timeout);
				}
			}
			let step = self.task.execute(request).await?;
			if let Some(gate) = &self.gate {
				match step {
					Step::Advanced => gate.on_success(self.task.chunk()),
					Step::TimedOut => gate.on_timeout(self.task.chunk()),
					Step::Interrupted => (),
				}
			}
			match step {
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
impl ScanWork for DocumentScan {
	async fn call(mut self) -> Result<Self> {
		self.run().await?;
		Ok(self)
	}

	fn finished(&self) -> bool {
		self.task.finished()
	}

	fn deferred(&self) -> bool {
		self.deferred
	}
}

#[async_trait]
impl ScanAttempt<Document> for DocumentScan {
	fn attach(&mut self, sink: ResultSink<Document>, cancel: CancellationToken) {
		self.task.attach(sink, cancel)
	}

	async fn run(&mut self) -> Result<()> {
		DocumentScan::run(self).await
	}

	fn chunk(&self) -> &WorkChunk {
		self.task.chunk()
	}

	fn finished(&self) -> bool {
		self.task.finished()
	}

	fn deferred(&self) -> bool {
		self.deferred
	}

	fn close(&self) {
		self.task.close()
	}
}
