use std::sync::LazyLock;
use std::time::Duration;

/// The name of the server-side iterator option which carries the scan correlation id.
pub const SCAN_ID_OPTION: &str = "scan.id";

/// The number of results which can be buffered in the shared output queue.
pub static OUTPUT_QUEUE_CAPACITY: LazyLock<usize> =
	lazy_env_parse!("TABLETSCAN_OUTPUT_QUEUE_CAPACITY", usize, 1000);

/// The maximum number of results fetched from a resource in one acquisition.
pub static SCAN_BATCH_SIZE: LazyLock<usize> =
	lazy_env_parse!("TABLETSCAN_SCAN_BATCH_SIZE", usize, 1000);

/// How long a producer waits on a full output queue before checking for shutdown again.
pub static OFFER_RETRY_INTERVAL: LazyLock<Duration> =
	lazy_env_parse!(millis, "TABLETSCAN_OFFER_RETRY_INTERVAL", 200);

/// The number of concurrent attempts a speculative scan runs at once.
pub static SPECULATIVE_POOL_SIZE: LazyLock<usize> =
	lazy_env_parse!("TABLETSCAN_SPECULATIVE_POOL_SIZE", usize, 2);

/// The number of scan tasks which may run concurrently on a worker pool.
pub static WORKER_POOL_SIZE: LazyLock<usize> =
	lazy_env_parse!("TABLETSCAN_WORKER_POOL_SIZE", usize, || num_cpus::get());

/// The number of scan resources the in-memory store hands out concurrently.
pub static RESOURCE_POOL_SIZE: LazyLock<usize> =
	lazy_env_parse!("TABLETSCAN_RESOURCE_POOL_SIZE", usize, 16);

/// How long a server which timed out is refused by the server health gate.
pub static SERVER_COOLDOWN: LazyLock<Duration> =
	lazy_env_parse!(millis, "TABLETSCAN_SERVER_COOLDOWN", 30_000);

/// How long timeouts from a server must persist, without progress, before it is avoided.
pub static SERVER_ERROR_WINDOW: LazyLock<Duration> =
	lazy_env_parse!(millis, "TABLETSCAN_SERVER_ERROR_WINDOW", 0);
