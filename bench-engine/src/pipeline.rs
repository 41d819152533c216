//! Task wiring: capture -> decode -> {aggregate+detect -> persist} (spec.md
//! S2 data flow, S5 concurrency model).
//!
//! Each stage polls its bounded queue non-blockingly and sleeps briefly
//! when empty, per spec.md S5 ("non-blocking queue probes with short
//! sleeps (<=10ms)"), except the Batch Writer, which is I/O-bound and runs
//! on a blocking thread.

use bench_capture::CaptureClient;
use bench_coordinator::{ExperimentCoordinator, HealthSnapshot};
use bench_pipeline::BoundedQueue;
use bench_protocol::{DecodedBatch, DecoderStats, ProtocolDecoder};
use bench_store::{BatchWriter, BatchWriterConfig, PersistItem, Storage};
use chrono::Local;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};

const EMPTY_QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Runs the capture read loop, reconnecting on every non-cancelled exit
/// (spec.md S4.2 state machine: Error/Disconnected are not terminal while
/// the process keeps running).
pub async fn capture_task(
    capture: Arc<CaptureClient>,
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    ingest: Arc<BoundedQueue<Vec<u8>>>,
    mut cancel: watch::Receiver<bool>,
) {
    while !*cancel.borrow() {
        match capture.run(&host, port, connect_timeout, read_timeout, &ingest, cancel.clone()).await {
            Ok(()) => {}
            Err(e) => tracing::warn!(error = %e, "capture loop ended, will retry"),
        }
        if *cancel.borrow() {
            break;
        }
        capture.begin_reconnect();
        tokio::select! {
            _ = tokio::time::sleep(connect_timeout.min(Duration::from_secs(1))) => {}
            _ = cancel.changed() => {}
        }
    }
    tracing::info!("capture task exiting");
}

/// Drains raw chunks, decodes them, and forwards complete frames to the
/// decode queue (spec.md S4.4/S4.5).
pub async fn decode_task(
    ingest: Arc<BoundedQueue<Vec<u8>>>,
    decode_out: Arc<BoundedQueue<DecodedBatch>>,
    decoder_stats: Arc<StdMutex<DecoderStats>>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut decoder = ProtocolDecoder::new();
    loop {
        match ingest.dequeue() {
            Some(chunk) => {
                let now = Local::now().naive_local();
                for batch in decoder.feed(&chunk, now) {
                    decode_out.enqueue(batch);
                }
                *decoder_stats.lock().unwrap() = decoder.stats();
            }
            None => {
                if *cancel.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(EMPTY_QUEUE_POLL_INTERVAL) => {}
                    _ = cancel.changed() => {}
                }
            }
        }
    }
    tracing::info!(
        frames = decoder.stats().frames_decoded,
        gaps = decoder.stats().gap_count,
        "decode task exiting"
    );
}

/// Drains decoded frames and routes them through the coordinator to every
/// running post; also drives the coordinator's periodic tick so idle
/// channels still emit regular-grid windows and no-data timeouts.
pub async fn coordinator_task(
    coordinator: Arc<Mutex<ExperimentCoordinator>>,
    decode_in: Arc<BoundedQueue<DecodedBatch>>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        match decode_in.dequeue() {
            Some(batch) => {
                coordinator.lock().await.route_batch(&batch);
            }
            None => {
                let now = Local::now().naive_local();
                coordinator.lock().await.tick(now);
                if *cancel.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(EMPTY_QUEUE_POLL_INTERVAL) => {}
                    _ = cancel.changed() => {}
                }
            }
        }
    }
    tracing::info!("coordinator task exiting");
}

/// Periodically assembles a [`HealthSnapshot`] from every stage's counters
/// and fans it out through the coordinator's subscribers (spec.md S7).
pub async fn health_task(
    coordinator: Arc<Mutex<ExperimentCoordinator>>,
    ingest: Arc<BoundedQueue<Vec<u8>>>,
    decode: Arc<BoundedQueue<DecodedBatch>>,
    decoder_stats: Arc<StdMutex<DecoderStats>>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            break;
        }
        let stats = *decoder_stats.lock().unwrap();
        let external = HealthSnapshot {
            ingest_queue_depth: ingest.len(),
            ingest_dropped: ingest.dropped_count(),
            decode_queue_depth: decode.len(),
            decode_dropped: decode.dropped_count(),
            decoder_gap_count: stats.gap_count,
            decoder_buffer_overflow_count: stats.buffer_overflow_count,
            ..Default::default()
        };
        if let Err(e) = coordinator.lock().await.report_health(external) {
            tracing::warn!(error = %e, "health snapshot fan-out failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(HEALTH_REPORT_INTERVAL) => {}
            _ = cancel.changed() => {}
        }
    }
    tracing::info!("health task exiting");
}

/// Flushes the persist queue on a size-or-time trigger (spec.md S4.9) and
/// checkpoints the WAL on its own slower cadence. Runs on a blocking
/// thread since the Store's commit may block.
pub fn batch_writer_task(
    storage: Arc<Storage>,
    persist_queue: Arc<BoundedQueue<PersistItem>>,
    batch_size: usize,
    flush_interval: Duration,
    checkpoint_interval: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let writer = BatchWriter::new(storage.clone(), BatchWriterConfig::default());
    let mut first_unflushed_at: Option<std::time::Instant> = None;
    let mut last_checkpoint_at = std::time::Instant::now();
    loop {
        let depth = persist_queue.len();
        let interval_elapsed = first_unflushed_at.is_some_and(|t| t.elapsed() >= flush_interval);
        if depth >= batch_size || interval_elapsed {
            let items = persist_queue.drain_up_to(batch_size.max(depth));
            if !items.is_empty() {
                let now = Local::now().naive_local();
                if let Err(e) = writer.flush(&items, now) {
                    tracing::error!(error = %e, "batch flush failed after retries, items quarantined");
                }
            }
            first_unflushed_at = None;
        } else if depth > 0 && first_unflushed_at.is_none() {
            first_unflushed_at = Some(std::time::Instant::now());
        }

        if last_checkpoint_at.elapsed() >= checkpoint_interval {
            if let Err(e) = storage.checkpoint() {
                tracing::warn!(error = %e, "wal checkpoint failed");
            }
            last_checkpoint_at = std::time::Instant::now();
        }

        if *cancel.borrow() && persist_queue.is_empty() {
            break;
        }
        std::thread::sleep(EMPTY_QUEUE_POLL_INTERVAL);
    }
    tracing::info!("batch writer task exiting");
}
