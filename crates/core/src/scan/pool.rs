use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};

use crate::err::Error;

/// A unit of scan work which can be time-sliced.
///
/// Each call runs the work until it finishes, is interrupted by a store
/// timeout, or is deferred by an admission gate, and then hands the work
/// back so that it can be scheduled again.
#[async_trait]
pub trait ScanWork: Send + Sized + 'static {
	async fn call(self) -> Result<Self>;

	/// Whether there is nothing left to scan
	fn finished(&self) -> bool;

	/// Whether the last call declined to run, leaving the retry to the caller
	fn deferred(&self) -> bool {
		false
	}
}

#[derive(Default)]
struct Inner {
	closed: bool,
	tasks: Vec<AbortHandle>,
}

/// A bounded pool which runs units of work on the tokio runtime
pub struct WorkerPool {
	name: String,
	permits: Arc<Semaphore>,
	inner: Mutex<Inner>,
}

impl WorkerPool {
	pub fn new(name: impl Into<String>, size: usize) -> Self {
		Self {
			name: name.into(),
			permits: Arc::new(Semaphore::new(size.max(1))),
			inner: Mutex::new(Inner::default()),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Schedules a future, which waits for a free slot before it starts
	pub fn submit<F, R>(&self, fut: F) -> Result<JoinHandle<Result<R>>>
	where
		F: Future<Output = Result<R>> + Send + 'static,
		R: Send + 'static,
	{
		let mut inner = self.inner.lock();
		if inner.closed {
			bail!(Error::PoolShutdown(self.name.clone()));
		}
		let permits = self.permits.clone();
		let name = self.name.clone();
		let handle = tokio::spawn(async move {
			// The semaphore is closed when the pool shuts down
			let Ok(_permit) = permits.acquire_owned().await else {
				bail!(Error::PoolShutdown(name));
			};
			fut.await
		});
		inner.tasks.retain(|t| !t.is_finished());
		inner.tasks.push(handle.abort_handle());
		Ok(handle)
	}

	/// Stops accepting work and aborts everything queued or running
	pub fn shutdown_now(&self) {
		let tasks = {
			let mut inner = self.inner.lock();
			if inner.closed {
				return;
			}
			inner.closed = true;
			std::mem::take(&mut inner.tasks)
		};
		self.permits.close();
		debug!("Shutting down worker pool '{}', aborting {} tasks", self.name, tasks.len());
		for task in tasks {
			task.abort();
		}
	}

	pub fn is_shutdown(&self) -> bool {
		self.inner.lock().closed
	}

	/// Re-submits the work until it has finished or has been deferred
	pub async fn run_to_completion<W: ScanWork>(&self, mut work: W) -> Result<W> {
		loop {
			work = self.submit(work.call())?.await??;
			if work.finished() || work.deferred() {
				return Ok(work);
			}
			trace!("Rescheduling time-sliced scan work on pool '{}'", self.name);
		}
	}
}

impl Drop for WorkerPool {
	fn drop(&mut self) {
		self.shutdown_now();
	}
}
