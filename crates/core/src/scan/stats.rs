use std::fmt;
use std::time::{Duration, Instant};

/// The phases of a scan session which are timed
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TimedOperation {
	/// Selecting a range and acquiring a resource for it
	ScannerStart,
	/// Pulling results from the resource and emitting them
	ScannerIterate,
}

/// A timer which can be paused and resumed, accumulating the running time
#[derive(Clone, Debug, Default)]
struct Stopwatch {
	elapsed: Duration,
	running: Option<Instant>,
}

impl Stopwatch {
	fn resume(&mut self) {
		if self.running.is_none() {
			self.running = Some(Instant::now());
		}
	}

	fn suspend(&mut self) {
		if let Some(at) = self.running.take() {
			self.elapsed += at.elapsed();
		}
	}

	fn elapsed(&self) -> Duration {
		match self.running {
			Some(at) => self.elapsed + at.elapsed(),
			None => self.elapsed,
		}
	}
}

/// Per-task scan statistics.
///
/// Every task owns its statistics. Cloning produces an independent copy,
/// which is what a speculative attempt receives when it is derived from
/// another task.
#[derive(Clone, Debug, Default)]
pub struct ScanSessionStats {
	start: Stopwatch,
	iterate: Stopwatch,
	pub keys_seen: u64,
	pub ranges_scanned: u64,
	pub acquisitions: u64,
	pub timeouts: u64,
	pub backpressure_waits: u64,
}

impl ScanSessionStats {
	pub fn new() -> Self {
		Self::default()
	}

	fn timer(&mut self, op: TimedOperation) -> &mut Stopwatch {
		match op {
			TimedOperation::ScannerStart => &mut self.start,
			TimedOperation::ScannerIterate => &mut self.iterate,
		}
	}

	pub fn resume(&mut self, op: TimedOperation) {
		self.timer(op).resume()
	}

	pub fn suspend(&mut self, op: TimedOperation) {
		self.timer(op).suspend()
	}

	/// Stops every running timer
	pub fn stop(&mut self) {
		self.start.suspend();
		self.iterate.suspend();
	}

	pub fn elapsed(&self, op: TimedOperation) -> Duration {
		match op {
			TimedOperation::ScannerStart => self.start.elapsed(),
			TimedOperation::ScannerIterate => self.iterate.elapsed(),
		}
	}

	/// Adds the counters and timings of another session into this one
	pub fn merge(&mut self, other: &ScanSessionStats) {
		self.start.elapsed += other.elapsed(TimedOperation::ScannerStart);
		self.iterate.elapsed += other.elapsed(TimedOperation::ScannerIterate);
		self.keys_seen += other.keys_seen;
		self.ranges_scanned += other.ranges_scanned;
		self.acquisitions += other.acquisitions;
		self.timeouts += other.timeouts;
		self.backpressure_waits += other.backpressure_waits;
	}
}

impl fmt::Display for ScanSessionStats {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"keys={} ranges={} acquisitions={} timeouts={} backpressure={} start={:?} iterate={:?}",
			self.keys_seen,
			self.ranges_scanned,
			self.acquisitions,
			self.timeouts,
			self.backpressure_waits,
			self.elapsed(TimedOperation::ScannerStart),
			self.elapsed(TimedOperation::ScannerIterate),
		)
	}
}
