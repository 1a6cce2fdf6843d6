//! Racing several scans of the same chunk, and keeping one.
//!
//! A [`SpeculativeScan`] runs two or more attempts over copies of one
//! [`WorkChunk`], typically with different strategies or against different
//! servers, to bound the tail latency of a slow server. Every attempt writes
//! into a private buffer. The first attempt to succeed becomes the winner:
//! only its buffer is drained into the shared output, and only it is allowed
//! to carry on with continuations. Everything the other attempts produce is
//! discarded, so the output holds exactly one attempt's results.
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_channel::Receiver;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ResultSink, ScanSessionStats, ScanWork, WorkChunk, WorkerPool};
use crate::cnf::SPECULATIVE_POOL_SIZE;
use crate::err::{self, Error};

/// Identifies an attempt within a speculative scan
pub type AttemptId = usize;

const NO_WINNER: AttemptId = AttemptId::MAX;

/// One contender of a speculative scan
#[async_trait]
pub trait ScanAttempt<T>: Send + 'static {
	/// Redirects the attempt's output into a private buffer, under the group's cancellation
	fn attach(&mut self, sink: ResultSink<T>, cancel: CancellationToken);

	/// Runs the attempt until it finishes or is time-sliced
	async fn run(&mut self) -> Result<()>;

	fn chunk(&self) -> &WorkChunk;

	/// Whether there is nothing left to scan
	fn finished(&self) -> bool;

	/// Whether the last run was refused by an admission gate
	fn deferred(&self) -> bool {
		false
	}

	fn close(&self);
}

struct Shared<T> {
	output: ResultSink<T>,
	/// Cancelled when the group closes, and parent of every attempt's token
	cancel: CancellationToken,
	committed: AtomicBool,
	closed: AtomicBool,
	/// Set once the caller waits, after which no more attempts are expected
	sealed: AtomicBool,
	failed: AtomicBool,
	panicked: AtomicBool,
	/// Held while a buffer is drained into the output
	guard: tokio::sync::Mutex<()>,
	winner: AtomicUsize,
	total: AtomicUsize,
	successes: AtomicUsize,
	failures: AtomicUsize,
	failure: Mutex<Option<anyhow::Error>>,
	stats: Mutex<ScanSessionStats>,
	pool: WorkerPool,
}

impl<T: Send + 'static> Shared<T> {
	fn spawn(
		self: &Arc<Self>,
		id: AttemptId,
		attempt: Box<dyn ScanAttempt<T>>,
		buffer: Receiver<T>,
	) -> Result<()> {
		let shared = self.clone();
		self.pool.submit(async move {
			Self::drive(shared, id, attempt, buffer).await;
			Ok(())
		})?;
		Ok(())
	}

	fn drive(
		shared: Arc<Self>,
		id: AttemptId,
		mut attempt: Box<dyn ScanAttempt<T>>,
		buffer: Receiver<T>,
	) -> BoxFuture<'static, ()> {
		async move {
			let res = AssertUnwindSafe(attempt.run()).catch_unwind().await;
			match res {
				Err(panic) => shared.on_panic(id, panic),
				Ok(Err(e)) => shared.on_failure(id, e).await,
				Ok(Ok(())) => {
					if attempt.deferred() {
						let location = attempt.chunk().last_known_location().to_string();
						shared.on_failure(id, Error::AdmissionDenied(location).into()).await
					} else {
						shared.on_success(id, attempt, buffer).await
					}
				}
			}
		}
		.boxed()
	}

	async fn on_success(
		self: &Arc<Self>,
		id: AttemptId,
		attempt: Box<dyn ScanAttempt<T>>,
		buffer: Receiver<T>,
	) {
		self.successes.fetch_add(1, Ordering::SeqCst);
		if self.committed.load(Ordering::SeqCst) {
			trace!("Discarding the results of speculative attempt {id}, a winner has committed");
			attempt.close();
			return;
		}
		let guard = match self.winner.load(Ordering::SeqCst) {
			// The winner always drains, waiting for any sibling which holds the guard
			w if w == id => self.guard.lock().await,
			NO_WINNER => {
				// The guard is also held briefly by failing siblings, so wait for it
				// and only then decide whether another attempt has won
				let guard = self.guard.lock().await;
				if self.committed.load(Ordering::SeqCst) {
					trace!("Discarding the results of speculative attempt {id}, a winner has committed");
					attempt.close();
					return;
				}
				if self
					.winner
					.compare_exchange(NO_WINNER, id, Ordering::SeqCst, Ordering::SeqCst)
					.is_err()
				{
					trace!("Discarding the results of speculative attempt {id}, it lost the race");
					attempt.close();
					return;
				}
				debug!("Speculative attempt {id} won the race for query {}", attempt.chunk().query_id());
				guard
			}
			_ => {
				trace!("Discarding the results of speculative attempt {id}, it lost the race");
				attempt.close();
				return;
			}
		};
		// Drain the private buffer into the shared output
		let mut stats = ScanSessionStats::new();
		let mut res = Ok(());
		while let Ok(item) = buffer.try_recv() {
			res = self.output.offer(item, &self.cancel, &mut stats).await;
			if res.is_err() {
				break;
			}
		}
		drop(guard);
		self.stats.lock().merge(&stats);
		if let Err(e) = res {
			if err::is_interrupted(&e) {
				info!("Speculative scan stopped while committing attempt {id}: {e}");
				self.close();
			} else {
				error!("Speculative attempt {id} could not commit its results: {e}");
				self.store(e);
				self.give_up();
			}
			return;
		}
		if attempt.finished() {
			debug!("Speculative attempt {id} has committed");
			self.committed.store(true, Ordering::SeqCst);
			self.close();
			return;
		}
		// The winner was time-sliced, so its continuation carries on
		if self.closed.load(Ordering::SeqCst) {
			return;
		}
		if let Err(e) = self.spawn(id, attempt, buffer) {
			debug!("Unable to continue speculative attempt {id}: {e}");
			self.committed.store(true, Ordering::SeqCst);
			self.close();
		}
	}

	async fn on_failure(&self, id: AttemptId, err: anyhow::Error) {
		let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
		if self.closed.load(Ordering::SeqCst) {
			trace!("Speculative attempt {id} failed after the scan closed: {err}");
			return;
		}
		// Wait for any drain in progress, so that the winner is settled
		let winner = {
			let _guard = self.guard.lock().await;
			self.winner.load(Ordering::SeqCst)
		};
		let total = self.total.load(Ordering::SeqCst);
		if winner == id {
			// Output which has been published cannot be taken back
			error!("Speculative attempt {id} failed after committing results: {err}");
			self.store(err);
			self.give_up();
		} else if failures >= total && self.sealed.load(Ordering::SeqCst) {
			error!("All {total} speculative attempts failed, the last with: {err}");
			self.store(err);
			self.give_up();
		} else {
			warn!("Speculative attempt {id} failed ({failures} of {total}): {err}");
			self.store(err);
		}
	}

	fn on_panic(&self, id: AttemptId, panic: Box<dyn Any + Send>) {
		let message = if let Some(s) = panic.downcast_ref::<&str>() {
			s.to_string()
		} else if let Some(s) = panic.downcast_ref::<String>() {
			s.clone()
		} else {
			"unknown panic".to_string()
		};
		error!("Speculative attempt {id} panicked: {message}");
		self.failures.fetch_add(1, Ordering::SeqCst);
		// The first panic is the one reported
		if !self.panicked.swap(true, Ordering::SeqCst) {
			*self.failure.lock() = Some(Error::AttemptPanicked(message).into());
		}
		self.give_up();
	}

	/// Keeps the latest failure, unless a panic has been recorded
	fn store(&self, err: anyhow::Error) {
		if !self.panicked.load(Ordering::SeqCst) {
			*self.failure.lock() = Some(err);
		}
	}

	/// Fails the group with the stored failure, unless it has already closed
	fn give_up(&self) {
		if self.closed.load(Ordering::SeqCst) {
			return;
		}
		self.failed.store(true, Ordering::SeqCst);
		self.close();
	}

	fn close(&self) {
		self.committed.store(true, Ordering::SeqCst);
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		// Every attempt's token is a child of the group's token
		self.cancel.cancel();
		self.pool.shutdown_now();
	}
}

/// A group of racing scan attempts which commits exactly one winner's output
pub struct SpeculativeScan<T> {
	shared: Arc<Shared<T>>,
	caller: CancellationToken,
}

impl<T: Send + 'static> SpeculativeScan<T> {
	pub fn new(output: ResultSink<T>, cancel: &CancellationToken) -> Self {
		Self::with_pool_size(output, cancel, *SPECULATIVE_POOL_SIZE)
	}

	/// Creates a group whose private pool runs at most `size` attempts at once
	pub fn with_pool_size(output: ResultSink<T>, cancel: &CancellationToken, size: usize) -> Self {
		let shared = Shared {
			output,
			cancel: cancel.child_token(),
			committed: AtomicBool::new(false),
			closed: AtomicBool::new(false),
			sealed: AtomicBool::new(false),
			failed: AtomicBool::new(false),
			panicked: AtomicBool::new(false),
			guard: tokio::sync::Mutex::new(()),
			winner: AtomicUsize::new(NO_WINNER),
			total: AtomicUsize::new(0),
			successes: AtomicUsize::new(0),
			failures: AtomicUsize::new(0),
			failure: Mutex::new(None),
			stats: Mutex::new(ScanSessionStats::new()),
			pool: WorkerPool::new("speculative", size),
		};
		Self {
			shared: Arc::new(shared),
			caller: cancel.clone(),
		}
	}

	/// Starts another attempt, unless a winner has already committed.
	///
	/// The group is only failed for want of a successful attempt once
	/// [`SpeculativeScan::run`] has been called, so every attempt which is
	/// added beforehand gets its chance.
	pub fn add_scan<A: ScanAttempt<T>>(&self, mut attempt: A) -> bool {
		let shared = &self.shared;
		if shared.committed.load(Ordering::SeqCst) || shared.closed.load(Ordering::SeqCst) {
			return false;
		}
		let id = shared.total.fetch_add(1, Ordering::SeqCst);
		let (buffer, rx) = ResultSink::unbounded();
		attempt.attach(buffer, shared.cancel.child_token());
		trace!("Starting speculative attempt {id} for query {}", attempt.chunk().query_id());
		match shared.spawn(id, Box::new(attempt), rx) {
			Ok(()) => true,
			Err(e) => {
				debug!("Rejected speculative attempt {id}: {e}");
				shared.total.fetch_sub(1, Ordering::SeqCst);
				false
			}
		}
	}

	/// Waits until a winner commits, every attempt fails, or the scan is closed
	pub async fn run(&self) -> Result<()> {
		if self.shared.total.load(Ordering::SeqCst) == 0 {
			bail!(Error::NoScanAttempts);
		}
		// Attempts may all have failed before the caller started waiting
		self.shared.sealed.store(true, Ordering::SeqCst);
		if self.shared.failures.load(Ordering::SeqCst) >= self.shared.total.load(Ordering::SeqCst) {
			self.shared.give_up();
		}
		tokio::select! {
			_ = self.shared.cancel.cancelled() => (),
			_ = self.caller.cancelled() => {
				info!("Speculative scan was cancelled by its caller");
			}
		}
		self.shared.close();
		if self.shared.failed.load(Ordering::SeqCst) {
			return match self.shared.failure.lock().take() {
				Some(e) => Err(e),
				None => Err(Error::Unreachable("a failed speculative scan without a failure".into()).into()),
			};
		}
		Ok(())
	}

	/// Stops every attempt. Calling this more than once has no further effect.
	pub fn close(&self) {
		self.shared.close()
	}

	pub fn is_committed(&self) -> bool {
		self.shared.committed.load(Ordering::SeqCst)
	}

	pub fn is_closed(&self) -> bool {
		self.shared.closed.load(Ordering::SeqCst)
	}

	/// The number of attempts which have been started
	pub fn attempts(&self) -> usize {
		self.shared.total.load(Ordering::SeqCst)
	}

	pub fn successes(&self) -> usize {
		self.shared.successes.load(Ordering::SeqCst)
	}

	pub fn failures(&self) -> usize {
		self.shared.failures.load(Ordering::SeqCst)
	}

	/// Statistics of committing the winner's results
	pub fn stats(&self) -> ScanSessionStats {
		self.shared.stats.lock().clone()
	}
}

#[async_trait]
impl<T: Send + 'static> ScanWork for SpeculativeScan<T> {
	async fn call(self) -> Result<Self> {
		SpeculativeScan::run(&self).await?;
		Ok(self)
	}

	fn finished(&self) -> bool {
		self.is_closed()
	}
}
