use anyhow::{Result, bail};
use async_channel::{Receiver, Sender, TrySendError};
use tokio_util::sync::CancellationToken;

use super::ScanSessionStats;
use crate::cnf::OFFER_RETRY_INTERVAL;
use crate::err::Error;

/// The producing side of a scan's output queue.
///
/// The queue is bounded, and producers wait for capacity rather than drop
/// results. A wait is abandoned as soon as the scan is cancelled, or when the
/// consumer drops its receiver.
#[derive(Debug)]
pub struct ResultSink<T> {
	sender: Sender<T>,
}

impl<T> Clone for ResultSink<T> {
	fn clone(&self) -> Self {
		Self {
			sender: self.sender.clone(),
		}
	}
}

impl<T> From<Sender<T>> for ResultSink<T> {
	fn from(sender: Sender<T>) -> Self {
		Self {
			sender,
		}
	}
}

impl<T: Send> ResultSink<T> {
	/// Creates a sink over a new queue which holds at most `capacity` results
	pub fn bounded(capacity: usize) -> (Self, Receiver<T>) {
		let (sender, receiver) = async_channel::bounded(capacity);
		(Self::from(sender), receiver)
	}

	/// Creates a sink which never waits, used as the private buffer of a speculative attempt
	pub fn unbounded() -> (Self, Receiver<T>) {
		let (sender, receiver) = async_channel::unbounded();
		(Self::from(sender), receiver)
	}

	/// Whether the consumer has gone away
	pub fn is_closed(&self) -> bool {
		self.sender.is_closed()
	}

	/// Closes the queue, so that the consumer sees the end of the stream once drained
	pub fn close(&self) -> bool {
		self.sender.close()
	}

	pub fn len(&self) -> usize {
		self.sender.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sender.is_empty()
	}

	pub fn capacity(&self) -> Option<usize> {
		self.sender.capacity()
	}

	/// Pushes a result, waiting for capacity while the queue is full
	pub async fn offer(
		&self,
		item: T,
		cancel: &CancellationToken,
		stats: &mut ScanSessionStats,
	) -> Result<()> {
		if cancel.is_cancelled() {
			bail!(Error::ScanCancelled);
		}
		let item = match self.sender.try_send(item) {
			Ok(()) => return Ok(()),
			Err(TrySendError::Closed(_)) => bail!(Error::OutputClosed),
			Err(TrySendError::Full(item)) => item,
		};
		stats.backpressure_waits += 1;
		let send = self.sender.send(item);
		tokio::pin!(send);
		loop {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => bail!(Error::ScanCancelled),
				res = &mut send => {
					return match res {
						Ok(()) => Ok(()),
						Err(_) => Err(Error::OutputClosed.into()),
					};
				}
				_ = tokio::time::sleep(*OFFER_RETRY_INTERVAL) => {
					stats.backpressure_waits += 1;
					trace!("Output queue is still full after {:?}", *OFFER_RETRY_INTERVAL);
				}
			}
		}
	}
}
