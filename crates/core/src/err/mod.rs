use std::io;

use thiserror::Error;

/// An error originating from the scan layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The scan layer encountered unreachable logic
	#[error("The scan layer encountered unreachable logic: {0}")]
	Unreachable(String),

	/// There was a problem with the underlying datastore
	#[error("There was a problem with the underlying datastore: {0}")]
	Ds(String),

	/// The server timed out part way through a range. The scan can be resumed.
	#[error("The scan against server '{location}' timed out")]
	ScanTimedout {
		location: String,
	},

	/// The scan was cancelled before it could finish
	#[error("The scan was cancelled")]
	ScanCancelled,

	/// The consumer of the scan results is no longer listening
	#[error("The output queue has been closed by its consumer")]
	OutputClosed,

	/// The start of a range lies after its end
	#[error("Invalid range: {0}")]
	InvalidRange(String),

	/// A continuation key fell beyond the end of the range being resumed
	#[error("The continuation key {key} lies beyond the end of {range}")]
	ContinuationPastEnd {
		key: String,
		range: String,
	},

	/// A continuation key fell before the start of the range being resumed
	#[error("The continuation key {key} precedes the start of {range}")]
	MalformedContinuation {
		key: String,
		range: String,
	},

	/// The worker pool no longer accepts work
	#[error("The worker pool '{0}' has been shut down")]
	PoolShutdown(String),

	/// The admission gate refused to schedule work against a server
	#[error("Admission to server '{0}' was denied")]
	AdmissionDenied(String),

	/// A speculative scan was started without any attempts
	#[error("No attempts were registered with the speculative scan")]
	NoScanAttempts,

	/// An attempt of a speculative scan panicked
	#[error("A speculative scan attempt panicked: {0}")]
	AttemptPanicked(String),
}

impl Error {
	/// Whether this error is a recoverable store-level timeout
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::ScanTimedout { .. })
	}

	/// Whether this error signals that the scan was asked to stop
	pub fn is_cancellation(&self) -> bool {
		matches!(self, Error::ScanCancelled | Error::OutputClosed)
	}
}

/// Checks whether any error in the cause chain is a store-level timeout.
pub fn is_timeout(err: &anyhow::Error) -> bool {
	err.chain().any(|e| e.downcast_ref::<Error>().is_some_and(Error::is_timeout))
}

/// Checks whether a failure was caused by cancellation rather than by a real
/// problem with the store, by walking the cause chain for interruption markers.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
	err.chain().any(|e| {
		if let Some(e) = e.downcast_ref::<Error>() {
			return e.is_cancellation();
		}
		if let Some(e) = e.downcast_ref::<io::Error>() {
			return e.kind() == io::ErrorKind::Interrupted;
		}
		if let Some(e) = e.downcast_ref::<tokio::task::JoinError>() {
			return e.is_cancelled();
		}
		false
	})
}
