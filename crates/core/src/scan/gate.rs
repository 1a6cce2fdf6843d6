use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::WorkChunk;
use crate::cnf::{SERVER_COOLDOWN, SERVER_ERROR_WINDOW};

/// A circuit breaker consulted before single-record work is scheduled
/// against a server which may be degraded.
///
/// A refusal is not an error. The scan returns without doing anything, and
/// the caller is expected to retry the chunk later or by another route.
pub trait AdmissionGate: Send + Sync {
	/// Whether single-record work for this chunk may run now
	fn can_run(&self, chunk: &WorkChunk) -> bool;

	/// Called when the server hosting the chunk timed out
	fn on_timeout(&self, _chunk: &WorkChunk) {}

	/// Called when a scan of the chunk made progress
	fn on_success(&self, _chunk: &WorkChunk) {}
}

/// The recent history of one server
struct Health {
	/// When the current run of timeouts began
	first_error: Instant,
	/// When the server was last found to be degraded
	degraded_at: Option<Instant>,
}

/// Refuses work for servers which keep timing out.
///
/// A single timeout is tolerated. A server is only avoided once it times out
/// again at least the error window after its first timeout, with no progress
/// in between, and it is then avoided for the cooldown.
pub struct ServerHealthGate {
	cooldown: Duration,
	error_window: Duration,
	servers: DashMap<String, Health>,
}

impl Default for ServerHealthGate {
	fn default() -> Self {
		Self::new(*SERVER_COOLDOWN)
	}
}

impl ServerHealthGate {
	pub fn new(cooldown: Duration) -> Self {
		Self {
			cooldown,
			error_window: *SERVER_ERROR_WINDOW,
			servers: DashMap::new(),
		}
	}

	/// Sets how long timeouts must persist before a server is avoided
	pub fn with_error_window(mut self, window: Duration) -> Self {
		self.error_window = window;
		self
	}

	/// Whether the server is currently being avoided
	pub fn is_degraded(&self, location: &str) -> bool {
		match self.servers.get(location) {
			Some(health) => health.degraded_at.is_some_and(|at| at.elapsed() < self.cooldown),
			None => false,
		}
	}
}

impl AdmissionGate for ServerHealthGate {
	fn can_run(&self, chunk: &WorkChunk) -> bool {
		let location = chunk.last_known_location();
		if !self.is_degraded(location) {
			return true;
		}
		debug!("Refusing single-record work for query {} on degraded server {location}", chunk.query_id());
		false
	}

	fn on_timeout(&self, chunk: &WorkChunk) {
		let location = chunk.last_known_location();
		let now = Instant::now();
		match self.servers.entry(location.to_string()) {
			Entry::Vacant(entry) => {
				debug!("Server {location} timed out scanning query {}", chunk.query_id());
				entry.insert(Health {
					first_error: now,
					degraded_at: None,
				});
			}
			Entry::Occupied(mut entry) => {
				let health = entry.get_mut();
				if now.duration_since(health.first_error) >= self.error_window {
					warn!("Server {location} keeps timing out, avoiding it for {:?}", self.cooldown);
					health.degraded_at = Some(now);
				}
			}
		}
	}

	fn on_success(&self, chunk: &WorkChunk) {
		if self.servers.remove(chunk.last_known_location()).is_some() {
			debug!("Server {} has recovered", chunk.last_known_location());
		}
	}
}
