//! Acquisition engine process entry point (spec.md S6.4).
//!
//! Exit codes: 0 normal shutdown, 1 uncaught fatal error, 2 configuration
//! error.

mod config;
mod pipeline;

use bench_anomaly::ChannelThresholds;
use bench_capture::CaptureClient;
use bench_coordinator::{Experiment, ExperimentCoordinator, Post};
use bench_pipeline::BoundedQueue;
use bench_protocol::DecodedBatch;
use bench_registry::{ChannelGroup, ChannelRegistry};
use bench_store::{PersistItem, Storage};
use chrono::{Duration as ChronoDuration, Local};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Builds the live per-channel rule set from the `[[thresholds]]` config
/// tables (spec.md S4.7 "parameterized here" per open question 2).
/// Channels with no matching table get no anomaly rules at all.
fn build_thresholds(cfg: &[config::ChannelThresholdConfig]) -> HashMap<u16, ChannelThresholds> {
    cfg.iter()
        .map(|t| {
            (
                t.channel_index,
                ChannelThresholds {
                    min: t.min,
                    max: t.max,
                    min_critical: t.min_critical,
                    max_critical: t.max_critical,
                    min_hysteresis: t.min_hysteresis,
                    max_hysteresis: t.max_hysteresis,
                    delta_spike: t.delta_spike,
                    debounce_samples: t.debounce_samples,
                    no_data_timeout: ChronoDuration::seconds(t.no_data_timeout_sec),
                },
            )
        })
        .collect()
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Test bench acquisition engine", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "bench.toml")]
    config: PathBuf,
    /// Overrides `database.db_path` from the config file.
    #[arg(long)]
    db_path: Option<String>,
    /// Starts one experiment on the given post (A, B, or C) as soon as the
    /// pipeline comes up, using that post's full channel group as the
    /// default selection. Without this flag the engine only ingests,
    /// decodes, and recovers stale experiments; nothing is persisted.
    #[arg(long, value_parser = parse_post)]
    auto_start_post: Option<Post>,
    /// Experiment name recorded alongside `--auto-start-post`.
    #[arg(long, default_value = "auto")]
    experiment_name: String,
    /// Operator name recorded alongside `--auto-start-post`.
    #[arg(long, default_value = "unattended")]
    operator: String,
}

fn parse_post(s: &str) -> std::result::Result<Post, String> {
    match s.to_ascii_uppercase().as_str() {
        "A" => Ok(Post::A),
        "B" => Ok(Post::B),
        "C" => Ok(Post::C),
        other => Err(format!("unknown post {other:?}, expected A, B, or C")),
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut cfg = match config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };
    if let Some(db_path) = args.db_path {
        cfg.database.db_path = db_path;
    }
    let auto_start = args.auto_start_post.map(|post| AutoStart {
        post,
        name: args.experiment_name,
        operator: args.operator,
    });

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(cfg, auto_start)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            std::process::exit(1);
        }
    }
}

/// Requested via `--auto-start-post`: starts one experiment on a post as
/// soon as the pipeline is up, rather than waiting for an external caller
/// to drive [`ExperimentCoordinator::start`] (out of scope per spec.md S1
/// Non-goals: "no GUI, no interactive control surface").
struct AutoStart {
    post: Post,
    name: String,
    operator: String,
}

async fn run(cfg: config::BenchConfig, auto_start: Option<AutoStart>) -> anyhow::Result<()> {
    let storage = Arc::new(Storage::open(&cfg.database.db_path)?);

    let ingest_queue = Arc::new(BoundedQueue::<Vec<u8>>::new(cfg.pipeline.ingest));
    let decode_queue = Arc::new(BoundedQueue::<DecodedBatch>::new(cfg.pipeline.decode));
    let persist_queue = Arc::new(BoundedQueue::<PersistItem>::new(cfg.pipeline.persist));

    let mut coordinator = ExperimentCoordinator::new(storage.clone(), persist_queue.clone());
    let running_ids = storage.running_experiment_ids()?;
    if !running_ids.is_empty() {
        coordinator.recover(&running_ids, Local::now().naive_local())?;
    }
    if let Some(auto_start) = auto_start {
        let now = Local::now().naive_local();
        let registry = ChannelRegistry::global();
        let group = match auto_start.post {
            Post::A => ChannelGroup::PostA,
            Post::B => ChannelGroup::PostB,
            Post::C => ChannelGroup::PostC,
        };
        let selected_channels = registry.indices_in_group(group);
        let experiment = Experiment {
            id: format!("{}-{}", auto_start.name, now.format("%Y%m%d%H%M%S")),
            name: auto_start.name,
            operator: auto_start.operator,
            part_metadata: String::new(),
            post: auto_start.post,
            batch_size: cfg.database.batch_size,
            aggregation_interval_secs: cfg.aggregation.interval_sec,
            checkpoint_interval_secs: cfg.aggregation.interval_sec,
            selected_channels,
            started_at: now,
            ended_at: None,
        };
        coordinator.start(experiment, build_thresholds(&cfg.thresholds))?;
    }
    let coordinator = Arc::new(Mutex::new(coordinator));

    let capture = Arc::new(CaptureClient::new());
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let capture_handle = tokio::spawn(pipeline::capture_task(
        capture.clone(),
        cfg.transmitter.ip_address.clone(),
        cfg.transmitter.port,
        Duration::from_millis(cfg.transmitter.connection_timeout_ms),
        Duration::from_millis(cfg.transmitter.read_timeout_ms),
        ingest_queue.clone(),
        cancel_rx.clone(),
    ));
    let decoder_stats = Arc::new(std::sync::Mutex::new(bench_protocol::DecoderStats::default()));
    let decode_handle = tokio::spawn(pipeline::decode_task(
        ingest_queue.clone(),
        decode_queue.clone(),
        decoder_stats.clone(),
        cancel_rx.clone(),
    ));
    let coordinator_handle = tokio::spawn(pipeline::coordinator_task(
        coordinator.clone(),
        decode_queue.clone(),
        cancel_rx.clone(),
    ));
    let health_handle = tokio::spawn(pipeline::health_task(
        coordinator.clone(),
        ingest_queue.clone(),
        decode_queue.clone(),
        decoder_stats.clone(),
        cancel_rx.clone(),
    ));
    let writer_storage = storage.clone();
    let writer_queue = persist_queue.clone();
    let batch_size = cfg.database.batch_size;
    let flush_interval = Duration::from_secs(cfg.database.flush_interval_sec);
    let checkpoint_interval = Duration::from_secs(cfg.database.checkpoint_interval_sec);
    let writer_cancel = cancel_rx.clone();
    let writer_handle = std::thread::spawn(move || {
        pipeline::batch_writer_task(
            writer_storage,
            writer_queue,
            batch_size,
            flush_interval,
            checkpoint_interval,
            writer_cancel,
        );
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining pipeline");
    cancel_tx.send(true)?;

    // Pipeline drain is bounded to roughly 2s per stage (spec.md S5).
    let drain_budget = Duration::from_secs(2);
    let _ = tokio::time::timeout(drain_budget, capture_handle).await;
    let _ = tokio::time::timeout(drain_budget, decode_handle).await;
    let _ = tokio::time::timeout(drain_budget, coordinator_handle).await;
    let _ = tokio::time::timeout(drain_budget, health_handle).await;
    let _ = tokio::task::spawn_blocking(move || writer_handle.join()).await;

    Ok(())
}
