use bench_coordinator::{CoordinatorError, Experiment, ExperimentCoordinator, Post};
use bench_pipeline::BoundedQueue;
use bench_protocol::{DecodedBatch, DecodedSample, SampleValue};
use bench_store::{NewExperiment, PersistItem, Storage};
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::sync::Arc;

fn t(secs: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap() + ChronoDuration::seconds(secs)
}

fn experiment(post: Post, id: &str, channels: Vec<u16>) -> Experiment {
    Experiment {
        id: id.to_string(),
        name: "integration".into(),
        operator: "op".into(),
        part_metadata: String::new(),
        post,
        batch_size: 500,
        aggregation_interval_secs: 20,
        checkpoint_interval_secs: 30,
        selected_channels: channels,
        started_at: t(0),
        ended_at: None,
    }
}

fn batch(sequence: u64, timestamp: NaiveDateTime, channel_index: u16, value: f64) -> DecodedBatch {
    DecodedBatch {
        timestamp,
        sequence,
        samples: vec![DecodedSample { channel_index, value: SampleValue::Valid(value) }],
    }
}

/// Drives one post through its full state machine with real frames
/// flowing through `route_batch`, and checks the persisted rows the
/// Batch Writer would have flushed land correctly (spec.md S4.11, S8
/// scenario 4 "Window roll").
#[test]
fn full_post_lifecycle_persists_two_windows_and_finalizes() {
    let storage = Arc::new(Storage::open_in_memory().expect("open store"));
    let persist_queue = Arc::new(BoundedQueue::new(100));
    let mut coord = ExperimentCoordinator::new(storage.clone(), persist_queue.clone());

    coord
        .start(experiment(Post::A, "exp-lifecycle", vec![20]), HashMap::new())
        .expect("start experiment");

    for i in 0..41u64 {
        let secs = (i as f64 * 25.0 / 40.0) as i64;
        coord.route_batch(&batch(i, t(secs), 20, i as f64));
    }
    coord.stop(Post::A, t(40)).expect("stop experiment");
    coord.finalize(Post::A, t(41)).expect("finalize experiment");

    let items: Vec<PersistItem> = persist_queue.drain_up_to(1000);
    assert!(!items.is_empty(), "aggregated windows should have been queued");

    let window_items = items
        .iter()
        .filter(|item| matches!(item, PersistItem::AggregatedWindow { .. }))
        .count();
    assert_eq!(window_items, 2, "25s of samples over a 20s window rolls exactly twice");

    storage.write_batch(&items).expect("flush batch");
}

#[test]
fn starting_overlapping_channel_on_a_second_post_is_rejected() {
    let storage = Arc::new(Storage::open_in_memory().expect("open store"));
    let persist_queue = Arc::new(BoundedQueue::new(100));
    let mut coord = ExperimentCoordinator::new(storage, persist_queue);

    coord.start(experiment(Post::A, "exp-a", vec![10, 11]), HashMap::new()).expect("start A");
    let err = coord
        .start(experiment(Post::B, "exp-b", vec![11, 12]), HashMap::new())
        .expect_err("overlapping channel must be rejected");
    assert!(matches!(err, CoordinatorError::PostChannelConflict { channel: 11, .. }));

    // Post C with a disjoint selection should start cleanly alongside A.
    coord.start(experiment(Post::C, "exp-c", vec![100]), HashMap::new()).expect("start C");
}

#[test]
fn a_stale_running_experiment_is_recovered_to_stopped_on_startup() {
    let storage = Arc::new(Storage::open_in_memory().expect("open store"));
    storage
        .create_experiment(NewExperiment {
            id: "stale-exp",
            name: "previous run",
            operator: "op",
            part_metadata: "",
            post: "A",
            batch_size: 500,
            window_width_secs: 20,
            checkpoint_interval_secs: 30,
            selected_channels: &[1],
            started_at: t(0),
        })
        .expect("seed experiment");
    storage.set_experiment_status("stale-exp", "running", None).expect("mark running");

    let persist_queue = Arc::new(BoundedQueue::new(100));
    let mut coord = ExperimentCoordinator::new(storage.clone(), persist_queue);
    let running = storage.running_experiment_ids().expect("list running");
    assert_eq!(running, vec!["stale-exp".to_string()]);

    coord.recover(&running, t(5)).expect("recover");
    assert_eq!(storage.experiment_status("stale-exp").unwrap().as_deref(), Some("stopped"));
    let (_, last_state) = storage.last_state_transition("stale-exp").unwrap().expect("state row");
    assert_eq!(last_state, "stopped");
}
