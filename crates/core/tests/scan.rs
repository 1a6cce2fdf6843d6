//! Tests for resumable scans of raw entries

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use rstest::rstest;
use tabletscan_core::channel::Receiver;
use tabletscan_core::cnf::SCAN_ID_OPTION;
use tabletscan_core::err::Error;
use tabletscan_core::key::{Key, PartialKey};
use tabletscan_core::kvs::mem::{Faults, MemStore};
use tabletscan_core::kvs::{Entry, KeyRange, ResourceStrategy};
use tabletscan_core::scan::{
	ChunkVisitor, IteratorSetting, ResultSink, Scan, ScanOptions, WorkChunk, WorkerPool,
};
use tokio_util::sync::CancellationToken;

/// Fills a table with several columns and versions per row
fn populated() -> MemStore {
	let store = MemStore::new();
	for row in b'a'..=b'y' {
		let row = vec![row];
		for cq in ["name", "size"] {
			for ts in [3, 1] {
				store.put("shard", Key::new(row.clone(), "cf", cq, "", ts), format!("{cq}@{ts}"));
			}
		}
	}
	store
}

fn options() -> ScanOptions {
	ScanOptions::new().with_iterator(IteratorSetting::new(20, "query", "QueryIterator"))
}

fn chunk() -> WorkChunk {
	WorkChunk::new(
		"query-1",
		"shard",
		[KeyRange::rows("m", "z").unwrap(), KeyRange::rows("a", "m").unwrap()],
		options(),
		"tserver-1:9997",
	)
}

async fn keys(rx: Receiver<Entry>) -> Vec<Key> {
	let mut out = Vec::new();
	while let Ok(entry) = rx.recv().await {
		out.push(entry.key);
	}
	out
}

/// Scans the chunk to completion, re-submitting it whenever it is time-sliced
async fn scan_all(store: MemStore, batch_size: usize) -> Result<Vec<Key>> {
	let (sink, rx) = ResultSink::bounded(1000);
	let scan = Scan::new(chunk(), Arc::new(store), sink, &CancellationToken::new())
		.with_batch_size(batch_size);
	let pool = WorkerPool::new("test", 4);
	let scan = pool.run_to_completion(scan).await?;
	assert!(scan.finished());
	drop(scan);
	Ok(keys(rx).await)
}

#[rstest]
#[case::no_timeouts(vec![], 1000)]
#[case::one_timeout(vec![7], 1000)]
#[case::many_timeouts(vec![1, 5, 0, 12, 3], 1000)]
#[case::small_batches(vec![], 3)]
#[case::timeouts_and_small_batches(vec![2, 0, 1], 4)]
#[tokio::test(flavor = "multi_thread")]
async fn resumed_scans_have_no_gaps_or_overlaps(
	#[case] timeouts: Vec<usize>,
	#[case] batch_size: usize,
) -> Result<()> {
	let expected = scan_all(populated(), 1000).await?;
	assert_eq!(expected.len(), 25 * 4);
	assert!(expected.windows(2).all(|w| w[0] < w[1]));
	let store = populated().with_faults(Faults::default().timeout_after(timeouts));
	let actual = scan_all(store, batch_size).await?;
	assert_eq!(actual, expected);
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn a_timeout_resumes_after_the_last_key_before_the_next_range() -> Result<()> {
	let store = MemStore::new();
	for row in ["a", "c", "f", "k", "m", "p", "t"] {
		store.put("shard", Key::new(row, "cf", "cq", "", 1), row);
	}
	let store = Arc::new(store.with_faults(Faults::default().timeout_after([3])));
	let (sink, rx) = ResultSink::bounded(100);
	let mut scan = Scan::new(chunk(), store.clone(), sink, &CancellationToken::new());
	// The first call is time-sliced after emitting a, c, and f
	scan.run().await?;
	assert!(!scan.finished());
	assert_eq!(scan.stats().timeouts, 1);
	scan.run().await?;
	assert!(scan.finished());
	drop(scan);
	let rows: Vec<_> = keys(rx).await.into_iter().map(|k| k.row).collect();
	assert_eq!(rows, ["a", "c", "f", "k", "m", "p", "t"].map(|r| r.as_bytes().to_vec()));
	let requests = store.requests();
	assert_eq!(requests.len(), 3);
	let last = Key::new("f", "cf", "cq", "", 1);
	let resumed = &requests[1].range;
	assert_eq!(resumed.start(), Some(&last.following_key(PartialKey::RowColFamColQualColVisTime)));
	assert!(!resumed.contains(&last));
	assert_eq!(resumed.end(), Some(&Key::row("m")));
	assert!(!resumed.is_end_inclusive());
	assert_eq!(requests[2].range, KeyRange::rows("m", "z").unwrap());
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn every_physical_scan_gets_its_own_scan_id() -> Result<()> {
	let store = Arc::new(populated());
	let (sink, _rx) = ResultSink::bounded(1000);
	let chunk = chunk();
	let mut scan = Scan::new(chunk.clone(), store.clone(), sink, &CancellationToken::new()).with_batch_size(10);
	scan.run().await?;
	let requests = store.requests();
	assert!(requests.len() > 2);
	let mut ids: Vec<_> = requests.iter().map(|r| r.scan_id).collect();
	for request in &requests {
		let id = request.scan_id.to_string();
		assert_eq!(request.options.scan_id(), Some(id.as_str()));
		assert!(request.options.iterators().iter().all(|s| s.options.get(SCAN_ID_OPTION) == Some(&id)));
		assert_eq!(request.strategy, ResourceStrategy::Batch);
		assert_eq!(request.batch_size, 10);
	}
	ids.sort();
	ids.dedup();
	assert_eq!(ids.len(), requests.len());
	// The chunk's own configuration is never tagged
	assert!(chunk.options().scan_id().is_none());
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn resources_are_released_before_the_next_acquisition() -> Result<()> {
	let store = Arc::new(populated());
	let (sink, _rx) = ResultSink::bounded(1000);
	let mut scan = Scan::new(chunk(), store.clone(), sink, &CancellationToken::new()).with_batch_size(4);
	scan.run().await?;
	assert!(scan.finished());
	assert_eq!(store.peak_open(), 1);
	assert_eq!(store.releases(), store.requests().len());
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn store_failures_propagate_to_the_caller() -> Result<()> {
	let store = Arc::new(populated().with_faults(Faults::default().fail("tablet offline")));
	let (sink, rx) = ResultSink::bounded(10);
	let pool = WorkerPool::new("test", 1);
	let scan = Scan::new(chunk(), store, sink, &CancellationToken::new());
	let err = pool.run_to_completion(scan).await.err().unwrap();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Ds(_))));
	assert!(rx.is_empty());
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_stops_the_scan() -> Result<()> {
	let store = Arc::new(populated().with_faults(Faults::default().delay(Duration::from_millis(2))));
	let (sink, rx) = ResultSink::bounded(1000);
	let cancel = CancellationToken::new();
	let mut scan = Scan::new(chunk(), store.clone(), sink, &cancel);
	let trigger = cancel.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(30)).await;
		trigger.cancel();
	});
	scan.run().await?;
	assert!(scan.finished());
	assert!(rx.len() < 100);
	// Nothing more happens once cancelled
	let seen = rx.len();
	scan.run().await?;
	assert_eq!(rx.len(), seen);
	assert_eq!(store.releases(), store.requests().len());
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn a_dropped_consumer_stops_the_scan() -> Result<()> {
	let (sink, rx) = ResultSink::bounded(1);
	drop(rx);
	let mut scan = Scan::new(chunk(), Arc::new(populated()), sink, &CancellationToken::new());
	scan.run().await?;
	assert!(scan.finished());
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn the_output_queue_never_exceeds_its_capacity() -> Result<()> {
	let (sink, rx) = ResultSink::bounded(2);
	let scan = Scan::new(chunk(), Arc::new(populated()), sink, &CancellationToken::new());
	let producer = tokio::spawn(async move {
		let pool = WorkerPool::new("test", 1);
		pool.run_to_completion(scan).await
	});
	let mut count = 0;
	let mut peak = 0;
	loop {
		peak = peak.max(rx.len());
		tokio::time::sleep(Duration::from_micros(200)).await;
		match rx.recv().await {
			Ok(_) => count += 1,
			Err(_) => break,
		}
	}
	let scan = producer.await??;
	assert_eq!(count, 100);
	assert!(peak <= 2);
	assert!(scan.stats().backpressure_waits > 0);
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn visitors_rewrite_the_chunk_before_it_is_scanned() -> Result<()> {
	let store = Arc::new(populated());
	let narrow: ChunkVisitor = Arc::new(|chunk: WorkChunk| -> Result<WorkChunk> {
		Ok(chunk.with_ranges([KeyRange::rows("c", "e")?]))
	});
	let filter: ChunkVisitor = Arc::new(|chunk: WorkChunk| -> Result<WorkChunk> {
		let options = ScanOptions::clone(chunk.options())
			.with_iterator(IteratorSetting::new(5, "ageoff", "AgeOffFilter").with_option("ttl", "30d"));
		Ok(chunk.with_options(options))
	});
	let (sink, rx) = ResultSink::bounded(1000);
	let mut scan = Scan::new(chunk(), store.clone(), sink, &CancellationToken::new())
		.with_visitors(vec![narrow, filter])
		.with_batch_size(3);
	scan.run().await?;
	assert!(scan.finished());
	drop(scan);
	let rows: Vec<_> = keys(rx).await.into_iter().map(|k| k.row).collect();
	assert_eq!(rows.len(), 8);
	assert!(rows.iter().all(|r| r == b"c" || r == b"d"));
	let requests = store.requests();
	assert!(requests.len() > 1);
	// The first request covers the rewritten range, and every request carries both iterators
	assert_eq!(requests[0].range, KeyRange::rows("c", "e")?);
	for request in &requests {
		let names: Vec<_> = request.options.iterators().iter().map(|s| s.name.as_str()).collect();
		assert_eq!(names, vec!["ageoff", "query"]);
		assert_eq!(request.options.iterators()[0].options.get("ttl").map(String::as_str), Some("30d"));
	}
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn visitors_are_applied_once_across_time_slices() -> Result<()> {
	let calls = Arc::new(AtomicUsize::new(0));
	let counted = calls.clone();
	let visitor: ChunkVisitor = Arc::new(move |chunk: WorkChunk| -> Result<WorkChunk> {
		counted.fetch_add(1, Ordering::SeqCst);
		Ok(chunk)
	});
	let store = populated().with_faults(Faults::default().timeout_after([5, 9]));
	let (sink, rx) = ResultSink::bounded(1000);
	let scan = Scan::new(chunk(), Arc::new(store), sink, &CancellationToken::new()).with_visitors(vec![visitor]);
	let scan = WorkerPool::new("test", 2).run_to_completion(scan).await?;
	assert_eq!(scan.stats().timeouts, 2);
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	drop(scan);
	assert_eq!(keys(rx).await.len(), 25 * 4);
	Ok(())
}

#[tokio::test]
async fn a_failing_visitor_fails_the_scan() {
	let visitor: ChunkVisitor = Arc::new(|_: WorkChunk| -> Result<WorkChunk> {
		Err(Error::Unreachable("no plan for this chunk".into()).into())
	});
	let store = Arc::new(populated());
	let (sink, _rx) = ResultSink::bounded(10);
	let mut scan = Scan::new(chunk(), store.clone(), sink, &CancellationToken::new()).with_visitors(vec![visitor]);
	let err = scan.run().await.unwrap_err();
	assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Unreachable(_))));
	assert!(store.requests().is_empty());
}
