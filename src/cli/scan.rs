use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};
use tabletscan_core::channel::Receiver;
use tabletscan_core::cnf::{OUTPUT_QUEUE_CAPACITY, SCAN_BATCH_SIZE, WORKER_POOL_SIZE};
use tabletscan_core::key::Key;
use tabletscan_core::kvs::mem::{Faults, MemStore};
use tabletscan_core::kvs::{Document, Entry, KeyRange, Keyed};
use tabletscan_core::scan::{
	DocumentScan, ResultSink, Scan, ScanOptions, ScanSessionStats, ScanWork, ServerHealthGate,
	SpeculativeScan, WorkChunk, WorkerPool,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const TABLE: &str = "shard";
const FIELDS: [&str; 2] = ["name", "size"];

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Mode {
	/// Stream raw entries
	Scan,
	/// Stream documents aggregated per record
	Document,
	/// Race a time-sliced scan against a slow one, per tablet
	Speculative,
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Scan => f.write_str("scan"),
			Self::Document => f.write_str("document"),
			Self::Speculative => f.write_str("speculative"),
		}
	}
}

#[derive(Args, Debug)]
pub struct ScanCommandArguments {
	#[arg(help = "The number of records stored in each tablet")]
	#[arg(long, default_value_t = 10_000)]
	rows: usize,
	#[arg(help = "The number of tablets, each scanned as one work chunk")]
	#[arg(long, default_value_t = 4)]
	tablets: usize,
	#[arg(help = "How the tablets are scanned")]
	#[arg(long, value_enum, default_value_t = Mode::Scan)]
	mode: Mode,
	#[arg(help = "Make consecutive acquisitions time out after these numbers of results")]
	#[arg(long, value_delimiter = ',')]
	timeouts: Vec<usize>,
	#[arg(help = "The capacity of the shared output queue")]
	#[arg(long, default_value_t = *OUTPUT_QUEUE_CAPACITY)]
	capacity: usize,
	#[arg(help = "The maximum number of results pulled from one resource acquisition")]
	#[arg(long = "batch-size", default_value_t = *SCAN_BATCH_SIZE)]
	batch_size: usize,
	#[arg(help = "The logging level, or a full logging filter")]
	#[arg(env = "TABLETSCAN_LOG", long = "log", default_value = "info")]
	log: String,
}

pub async fn init(args: ScanCommandArguments) -> Result<()> {
	// Initialize logging
	crate::telemetry::builder().with_log_level(&args.log).init()?;
	// Stop the scans on ctrl-c
	let cancel = CancellationToken::new();
	let trigger = cancel.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("Interrupted, stopping all scans");
			trigger.cancel();
		}
	});
	let report = run(&args, &cancel).await?;
	println!("{report}");
	Ok(())
}

/// The outcome of scanning every tablet
#[derive(Debug)]
pub struct Report {
	pub mode: Mode,
	pub tablets: usize,
	pub results: usize,
	pub elapsed: Duration,
	pub stats: ScanSessionStats,
}

impl fmt::Display for Report {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		writeln!(
			f,
			"{} mode: {} results from {} tablets in {:?}",
			self.mode, self.results, self.tablets, self.elapsed
		)?;
		write!(f, "{}", self.stats)
	}
}

/// Scans a freshly populated store, checking the results which come back
pub async fn run(args: &ScanCommandArguments, cancel: &CancellationToken) -> Result<Report> {
	let store = populate(args.tablets, args.rows);
	info!("Populated {} entries over {} tablets", store.len(TABLE), args.tablets);
	let pool = Arc::new(WorkerPool::new("tabletscan", *WORKER_POOL_SIZE));
	let faults = || Faults::default().timeout_after(args.timeouts.iter().copied());
	let started = Instant::now();
	let (results, stats) = match args.mode {
		Mode::Scan => {
			let (sink, rx) = ResultSink::<Entry>::bounded(args.capacity);
			let scans: Vec<_> = chunks(args.tablets, args.rows)
				.map(|chunk| {
					let store = Arc::new(store.with_faults(faults()));
					Scan::new(chunk, store, sink.clone(), cancel).with_batch_size(args.batch_size)
				})
				.collect();
			drop(sink);
			let (results, stats) = tokio::try_join!(consume(rx), execute(&pool, scans, |s| s.stats().clone()))?;
			expect(results, args.tablets * args.rows * FIELDS.len())?;
			(results, stats)
		}
		Mode::Document => {
			let (sink, rx) = ResultSink::<Document>::bounded(args.capacity);
			let gate = Arc::new(ServerHealthGate::default());
			let scans: Vec<_> = chunks(args.tablets, args.rows)
				.map(|chunk| {
					let store = Arc::new(store.with_faults(faults()));
					DocumentScan::new(chunk, store, sink.clone(), cancel)
						.with_gate(gate.clone(), Duration::from_secs(1))
						.with_batch_size(args.batch_size)
				})
				.collect();
			drop(sink);
			let (results, stats) = tokio::try_join!(consume(rx), execute(&pool, scans, |s| s.stats().clone()))?;
			expect(results, args.tablets * args.rows)?;
			(results, stats)
		}
		Mode::Speculative => {
			let (sink, rx) = ResultSink::<Entry>::bounded(args.capacity);
			let groups: Vec<_> = chunks(args.tablets, args.rows)
				.map(|chunk| {
					let group = SpeculativeScan::new(sink.clone(), cancel);
					let sliced = store.with_faults(faults());
					let slow = store.with_faults(Faults::default().delay(Duration::from_millis(5)));
					for store in [sliced, slow] {
						let (unused, _) = ResultSink::unbounded();
						let scan = Scan::new(chunk.clone(), Arc::new(store), unused, cancel)
							.with_batch_size(args.batch_size);
						if !group.add_scan(scan) {
							warn!("Speculative scan of {} rejected an attempt", chunk.query_id());
						}
					}
					group
				})
				.collect();
			drop(sink);
			let (results, stats) = tokio::try_join!(consume(rx), execute(&pool, groups, |g| g.stats()))?;
			expect(results, args.tablets * args.rows * FIELDS.len())?;
			(results, stats)
		}
	};
	Ok(Report {
		mode: args.mode,
		tablets: args.tablets,
		results,
		elapsed: started.elapsed(),
		stats,
	})
}

fn tablet(t: usize) -> String {
	format!("t{t:03}")
}

/// Stores one record per row, as one column family with a couple of fields
fn populate(tablets: usize, rows: usize) -> MemStore {
	let store = MemStore::new();
	for t in 0..tablets {
		for r in 0..rows {
			let row = format!("{}_{r:08}", tablet(t));
			for field in FIELDS {
				store.put(TABLE, Key::new(row.clone(), "rec", field, "", 1), format!("{field}-{r}"));
			}
		}
	}
	store
}

/// One chunk per tablet, split into two ranges
fn chunks(tablets: usize, rows: usize) -> impl Iterator<Item = WorkChunk> {
	(0..tablets).filter_map(move |t| {
		let prefix = tablet(t);
		let mid = format!("{prefix}_{:08}", rows / 2);
		let ranges = [
			KeyRange::rows(format!("{prefix}_"), mid.clone()).ok()?,
			KeyRange::rows(mid, format!("{prefix}~")).ok()?,
		];
		Some(WorkChunk::new(format!("scan-{t}"), TABLE, ranges, ScanOptions::new(), "mem"))
	})
}

/// Runs every unit of work on the pool, and merges their statistics
async fn execute<W, F>(pool: &Arc<WorkerPool>, work: Vec<W>, stats: F) -> Result<ScanSessionStats>
where
	W: ScanWork,
	F: Fn(&W) -> ScanSessionStats,
{
	let mut set = JoinSet::new();
	for w in work {
		let pool = pool.clone();
		set.spawn(async move { pool.run_to_completion(w).await });
	}
	let mut total = ScanSessionStats::new();
	while let Some(res) = set.join_next().await {
		let w = res??;
		if w.deferred() {
			warn!("A scan was deferred by its admission gate before it finished");
		}
		total.merge(&stats(&w));
	}
	Ok(total)
}

/// Counts the results, checking that every tablet's results arrive in key order
async fn consume<T: Keyed>(rx: Receiver<T>) -> Result<usize> {
	let mut last: HashMap<Vec<u8>, Key> = HashMap::new();
	let mut count = 0;
	while let Ok(item) = rx.recv().await {
		let key = item.key();
		let tablet = key.row.iter().take_while(|&&b| b != b'_').copied().collect::<Vec<u8>>();
		if let Some(prev) = last.get(&tablet) {
			if prev >= key {
				bail!("Results for tablet {} arrived out of order: {key} after {prev}", String::from_utf8_lossy(&tablet));
			}
		}
		last.insert(tablet, key.clone());
		count += 1;
	}
	Ok(count)
}

fn expect(results: usize, expected: usize) -> Result<()> {
	if results != expected {
		bail!("Expected {expected} results, but the scans produced {results}");
	}
	Ok(())
}
