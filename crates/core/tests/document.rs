//! Tests for document scans and admission gating

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tabletscan_core::channel::Receiver;
use tabletscan_core::key::Key;
use tabletscan_core::kvs::mem::{Faults, MemStore};
use tabletscan_core::kvs::{Document, KeyRange, ResourceStrategy};
use tabletscan_core::scan::{
	AdmissionGate, DocumentScan, ResultSink, ScanOptions, ServerHealthGate, WorkChunk, WorkerPool,
	all_single_record,
};
use tokio_util::sync::CancellationToken;

const LOCATION: &str = "tserver-2:9997";

/// Stores ten documents in each of three shards, with three fields each
fn populated() -> MemStore {
	let store = MemStore::new();
	for shard in 0..3 {
		let row = format!("20240101_{shard}");
		for uid in 0..10 {
			let cf = format!("event\0uid-{uid:02}");
			for field in ["HOST", "PORT", "USER"] {
				store.put("shard", Key::new(row.clone(), cf.clone(), field, "", 5), field);
			}
		}
	}
	store
}

fn lookups(uids: &[u32]) -> WorkChunk {
	let ranges = uids.iter().map(|uid| KeyRange::document("20240101_1", format!("event\0uid-{uid:02}")));
	WorkChunk::new("query-7", "shard", ranges, ScanOptions::new(), LOCATION)
}

fn shards() -> WorkChunk {
	WorkChunk::new(
		"query-7",
		"shard",
		[KeyRange::exact_row("20240101_0"), KeyRange::exact_row("20240101_2")],
		ScanOptions::new(),
		LOCATION,
	)
}

async fn documents(rx: Receiver<Document>) -> Vec<Document> {
	let mut out = Vec::new();
	while let Ok(doc) = rx.recv().await {
		out.push(doc);
	}
	out
}

#[tokio::test(flavor = "multi_thread")]
async fn point_lookups_return_whole_documents() -> Result<()> {
	let chunk = lookups(&[7, 2, 4]);
	assert!(all_single_record(chunk.ranges()));
	let store = Arc::new(populated());
	let (sink, rx) = ResultSink::bounded(10);
	let mut scan = DocumentScan::new(chunk, store.clone(), sink, &CancellationToken::new());
	scan.run().await?;
	assert!(scan.finished());
	drop(scan);
	let docs = documents(rx).await;
	let ids: Vec<_> = docs.iter().map(|d| d.id().1.to_vec()).collect();
	assert_eq!(ids, [2, 4, 7].map(|uid| format!("event\0uid-{uid:02}").into_bytes()));
	assert!(docs.iter().all(|d| d.entries.len() == 3));
	assert!(store.requests().iter().all(|r| r.strategy == ResourceStrategy::PointLookup));
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_ranges_always_use_the_batch_strategy() -> Result<()> {
	let store = Arc::new(populated());
	let (sink, rx) = ResultSink::bounded(100);
	let mut scan = DocumentScan::new(shards(), store.clone(), sink, &CancellationToken::new())
		.with_strategy(ResourceStrategy::PointLookup)
		.with_batch_size(4);
	scan.run().await?;
	assert!(scan.finished());
	drop(scan);
	assert_eq!(documents(rx).await.len(), 20);
	let requests = store.requests();
	assert!(requests.len() > 2);
	assert!(requests.iter().all(|r| r.strategy == ResourceStrategy::Batch));
	assert!(requests.iter().all(|r| r.timeout.is_none()));
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_documents_are_not_repeated() -> Result<()> {
	let store = Arc::new(populated().with_faults(Faults::default().timeout_after([3, 0, 5])));
	let (sink, rx) = ResultSink::bounded(100);
	let scan = DocumentScan::new(shards(), store, sink, &CancellationToken::new());
	let pool = WorkerPool::new("test", 2);
	let scan = pool.run_to_completion(scan).await?;
	assert!(scan.finished());
	assert_eq!(scan.stats().timeouts, 3);
	drop(scan);
	let docs = documents(rx).await;
	assert_eq!(docs.len(), 20);
	assert!(docs.windows(2).all(|w| w[0].key < w[1].key));
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn a_refusing_gate_defers_without_scanning() -> Result<()> {
	let gate = Arc::new(ServerHealthGate::new(Duration::from_secs(60)).with_error_window(Duration::ZERO));
	let chunk = lookups(&[1, 2]);
	// The server has repeatedly timed out
	gate.on_timeout(&chunk);
	gate.on_timeout(&chunk);
	let store = Arc::new(populated());
	let (sink, rx) = ResultSink::bounded(10);
	let pool = WorkerPool::new("test", 1);
	let scan = DocumentScan::new(chunk, store.clone(), sink, &CancellationToken::new())
		.with_gate(gate.clone(), Duration::from_millis(500));
	let scan = pool.run_to_completion(scan).await?;
	assert!(scan.deferred());
	assert!(!scan.finished());
	assert!(store.requests().is_empty());
	assert!(rx.is_empty());
	assert_eq!(scan.chunk().remaining(), 2);
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn admitted_lookups_carry_the_gate_timeout() -> Result<()> {
	let gate = Arc::new(ServerHealthGate::new(Duration::from_secs(60)).with_error_window(Duration::ZERO));
	let store = Arc::new(populated());
	let (sink, rx) = ResultSink::bounded(10);
	let mut scan = DocumentScan::new(lookups(&[3]), store.clone(), sink, &CancellationToken::new())
		.with_gate(gate, Duration::from_millis(500));
	scan.run().await?;
	assert!(scan.finished());
	assert_eq!(rx.len(), 1);
	let requests = store.requests();
	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].timeout, Some(Duration::from_millis(500)));
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn timeouts_mark_the_server_as_degraded() -> Result<()> {
	let gate = Arc::new(ServerHealthGate::new(Duration::from_secs(60)).with_error_window(Duration::ZERO));
	let store = Arc::new(populated().with_faults(Faults::default().timeout_after([0, 0])));
	let (sink, _rx) = ResultSink::bounded(10);
	let mut scan = DocumentScan::new(lookups(&[3, 4]), store.clone(), sink, &CancellationToken::new())
		.with_gate(gate.clone(), Duration::from_millis(500));
	scan.run().await?;
	assert_eq!(scan.stats().timeouts, 1);
	// A single timeout is tolerated
	assert!(!gate.is_degraded(LOCATION));
	scan.run().await?;
	assert_eq!(scan.stats().timeouts, 2);
	assert!(gate.is_degraded(LOCATION));
	// The next run is refused, and the timed out range is kept
	scan.run().await?;
	assert!(scan.deferred());
	assert_eq!(scan.chunk().remaining(), 2);
	assert_eq!(store.requests().len(), 2);
	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn a_zero_gate_timeout_never_consults_the_gate() -> Result<()> {
	let gate = Arc::new(ServerHealthGate::new(Duration::from_secs(60)).with_error_window(Duration::ZERO));
	let chunk = lookups(&[5]);
	gate.on_timeout(&chunk);
	gate.on_timeout(&chunk);
	let (sink, rx) = ResultSink::bounded(10);
	let mut scan = DocumentScan::new(chunk, Arc::new(populated()), sink, &CancellationToken::new())
		.with_gate(gate, Duration::ZERO);
	scan.run().await?;
	assert!(!scan.deferred());
	assert!(scan.finished());
	assert_eq!(rx.len(), 1);
	Ok(())
}
