//! Experiment state machine and per-post pipeline wiring (spec.md S4.11).
//!
//! Owns the three post-scoped runtimes (one [`bench_aggregate::Aggregator`]
//! and one [`bench_anomaly::AnomalyDetector`] pair each), enforces the
//! per-post channel lock, and drives state transitions through the Store.

use bench_aggregate::{Aggregator, TimedSample};
use bench_anomaly::{AnomalyDetector, AnomalyEvent, ChannelThresholds};
use bench_pipeline::BoundedQueue;
use bench_protocol::{DecodedBatch, SampleValue};
use bench_store::{PersistItem, Storage};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Post {
    A,
    B,
    C,
}

impl Post {
    pub const ALL: [Post; 3] = [Post::A, Post::B, Post::C];

    fn label(self) -> &'static str {
        match self {
            Post::A => "A",
            Post::B => "B",
            Post::C => "C",
        }
    }

    fn from_label(label: &str) -> Option<Post> {
        match label {
            "A" => Some(Post::A),
            "B" => Some(Post::B),
            "C" => Some(Post::C),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentState {
    Idle,
    Running,
    Paused,
    Stopped,
    Finalized,
    Recovered,
}

impl ExperimentState {
    fn label(self) -> &'static str {
        match self {
            ExperimentState::Idle => "idle",
            ExperimentState::Running => "running",
            ExperimentState::Paused => "paused",
            ExperimentState::Stopped => "stopped",
            ExperimentState::Finalized => "finalized",
            ExperimentState::Recovered => "recovered",
        }
    }
}

/// One recording session on one post (spec.md S3 Experiment).
#[derive(Debug, Clone)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub operator: String,
    pub part_metadata: String,
    pub post: Post,
    pub batch_size: usize,
    pub aggregation_interval_secs: i64,
    pub checkpoint_interval_secs: i64,
    pub selected_channels: Vec<u16>,
    pub started_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("channel {channel} on post {requested:?} already owned by a running experiment on {owner:?}")]
    PostChannelConflict { channel: u16, requested: Post, owner: Post },
    #[error("post {0:?} is not in the expected state for this transition")]
    WrongState(Post),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] bench_store::BenchStoreError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Push notifications a consumer (UI, metrics exporter) can subscribe to,
/// modeled on the teacher's `NodeEventHandler` (spec.md S9: "a minimal
/// subscriber interface implemented by any consumer").
pub trait Subscriber: Send + Sync {
    fn on_health(&self, _snapshot: HealthSnapshot) {}
    fn on_sample(&self, _post: Post, _sample: TimedSample) {}
    fn on_anomaly(&self, _post: Post, _event: AnomalyEvent) {}
}

/// All counters the spec requires to be observable (spec.md S7).
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthSnapshot {
    pub ingest_queue_depth: usize,
    pub ingest_dropped: u64,
    pub decode_queue_depth: usize,
    pub decode_dropped: u64,
    pub persist_queue_depth: usize,
    pub persist_dropped: u64,
    pub decoder_gap_count: u64,
    pub decoder_buffer_overflow_count: u64,
    pub quarantined_count: u64,
}

struct PostRuntime {
    experiment: Experiment,
    state: ExperimentState,
    aggregator: Aggregator,
    detector: AnomalyDetector,
}

/// Drives the per-post experiment state machines and routes decoded
/// samples to the post(s) whose channel selection contains them.
pub struct ExperimentCoordinator {
    storage: Arc<Storage>,
    posts: HashMap<Post, PostRuntime>,
    persist_queue: Arc<BoundedQueue<PersistItem>>,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl ExperimentCoordinator {
    pub fn new(storage: Arc<Storage>, persist_queue: Arc<BoundedQueue<PersistItem>>) -> Self {
        ExperimentCoordinator {
            storage,
            posts: HashMap::new(),
            persist_queue,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn state_of(&self, post: Post) -> ExperimentState {
        self.posts.get(&post).map(|r| r.state).unwrap_or(ExperimentState::Idle)
    }

    /// Starts a new experiment on `experiment.post` (spec.md S4.11
    /// `start()`). Rejects overlapping channel selections across running
    /// posts with [`CoordinatorError::PostChannelConflict`].
    pub fn start(
        &mut self,
        experiment: Experiment,
        thresholds: HashMap<u16, ChannelThresholds>,
    ) -> Result<()> {
        self.check_channel_conflict(experiment.post, &experiment.selected_channels)?;

        self.storage.create_experiment(bench_store::NewExperiment {
            id: &experiment.id,
            name: &experiment.name,
            operator: &experiment.operator,
            part_metadata: &experiment.part_metadata,
            post: experiment.post.label(),
            batch_size: experiment.batch_size,
            window_width_secs: experiment.aggregation_interval_secs,
            checkpoint_interval_secs: experiment.checkpoint_interval_secs,
            selected_channels: &experiment.selected_channels,
            started_at: experiment.started_at,
        })?;
        self.storage.log_state_transition_now(
            &experiment.id,
            experiment.started_at,
            ExperimentState::Idle.label(),
            ExperimentState::Running.label(),
            None,
        )?;

        let aggregator = Aggregator::new(
            experiment.started_at,
            experiment.aggregation_interval_secs,
            &experiment.selected_channels,
        );
        let detector = AnomalyDetector::new(experiment.started_at, thresholds);

        tracing::info!(post = experiment.post.label(), experiment_id = %experiment.id, "experiment started");
        self.posts.insert(
            experiment.post,
            PostRuntime { experiment, state: ExperimentState::Running, aggregator, detector },
        );
        Ok(())
    }

    /// Stops feeding the post's accumulators; samples routed here while
    /// paused are discarded (spec.md S4.11 `pause()`).
    pub fn pause(&mut self, post: Post, now: NaiveDateTime) -> Result<()> {
        let runtime = self.require_state(post, ExperimentState::Running)?;
        runtime.state = ExperimentState::Paused;
        let id = runtime.experiment.id.clone();
        self.storage.log_state_transition_now(&id, now, "running", "paused", None)?;
        Ok(())
    }

    /// Restores window alignment by advancing every channel's window past
    /// `now` with no backfill (spec.md S4.11 `resume()`). Re-checks the
    /// channel lock before resuming: a post stays `Paused` rather than
    /// releasing its channels, so `start` already refuses another post an
    /// overlapping selection while this one is paused — this check exists
    /// so `resume` never depends on that ordering to hold (spec.md S8
    /// invariant 5: a channel is selected by at most one Running
    /// experiment at a time).
    pub fn resume(&mut self, post: Post, now: NaiveDateTime) -> Result<()> {
        let runtime = self.posts.get(&post).ok_or(CoordinatorError::WrongState(post))?;
        if runtime.state != ExperimentState::Paused {
            return Err(CoordinatorError::WrongState(post));
        }
        let channels = runtime.experiment.selected_channels.clone();
        self.check_channel_conflict(post, &channels)?;

        let runtime = self.require_state(post, ExperimentState::Paused)?;
        runtime.aggregator.resume(now);
        runtime.state = ExperimentState::Running;
        let id = runtime.experiment.id.clone();
        self.storage.log_state_transition_now(&id, now, "paused", "running", None)?;
        Ok(())
    }

    /// Rejects `channels` if any other post currently holding a `Running`
    /// or `Paused` experiment already selects one of them — a paused post
    /// keeps its channel lock since it can resume without re-declaring a
    /// selection (spec.md S3: "a channel index belongs to at most one
    /// currently-running experiment across posts").
    fn check_channel_conflict(&self, requesting_post: Post, channels: &[u16]) -> Result<()> {
        for (&other_post, runtime) in &self.posts {
            if other_post == requesting_post {
                continue;
            }
            if runtime.state != ExperimentState::Running && runtime.state != ExperimentState::Paused {
                continue;
            }
            for &channel in channels {
                if runtime.experiment.selected_channels.contains(&channel) {
                    return Err(CoordinatorError::PostChannelConflict {
                        channel,
                        requested: requesting_post,
                        owner: other_post,
                    });
                }
            }
        }
        Ok(())
    }

    /// Flushes all open windows with `window_end = now`, drains both
    /// accumulators into the persist queue, and moves to Stopped (spec.md
    /// S4.11 `stop()`).
    pub fn stop(&mut self, post: Post, now: NaiveDateTime) -> Result<()> {
        let runtime = self
            .posts
            .get_mut(&post)
            .ok_or(CoordinatorError::WrongState(post))?;
        if runtime.state != ExperimentState::Running && runtime.state != ExperimentState::Paused {
            return Err(CoordinatorError::WrongState(post));
        }
        let from = runtime.state.label();
        let windows = runtime.aggregator.flush_final(now);
        let experiment_id = runtime.experiment.id.clone();
        let width = runtime.experiment.aggregation_interval_secs;
        for window in windows {
            self.persist_queue.enqueue(PersistItem::AggregatedWindow {
                experiment_id: experiment_id.clone(),
                window_width_secs: width,
                window,
            });
        }
        runtime.state = ExperimentState::Stopped;
        self.storage.log_state_transition_now(&experiment_id, now, from, "stopped", None)?;
        self.storage.set_experiment_status(&experiment_id, "stopped", None)?;
        tracing::info!(post = post.label(), experiment_id = %experiment_id, "experiment stopped");
        Ok(())
    }

    /// Records the end time, writes the closing state row, enters
    /// Finalized (spec.md S4.11 `finalize()`).
    pub fn finalize(&mut self, post: Post, now: NaiveDateTime) -> Result<()> {
        let runtime = self.require_state(post, ExperimentState::Stopped)?;
        runtime.experiment.ended_at = Some(now);
        runtime.state = ExperimentState::Finalized;
        let id = runtime.experiment.id.clone();
        self.storage.log_state_transition_now(&id, now, "stopped", "finalized", None)?;
        self.storage.set_experiment_status(&id, "finalized", Some(now))?;
        Ok(())
    }

    /// For each Running experiment found in the Store at startup, rebuilds
    /// its post runtime from the stored record, enters it into
    /// [`ExperimentState::Recovered`], logs that transition, then moves it
    /// to Stopped without reopening capture (spec.md S4.11 `recover()`).
    /// A record whose post is already occupied by another experiment (this
    /// process never started routing to it) is still recovered — there is
    /// no live conflict to enforce against, since nothing has run yet.
    pub fn recover(&mut self, experiment_ids: &[String], now: NaiveDateTime) -> Result<()> {
        for id in experiment_ids {
            let Some(record) = self.storage.experiment_record(id)? else { continue };
            let Some(post) = Post::from_label(&record.post) else {
                tracing::warn!(experiment_id = %id, post = %record.post, "unrecognized post on recovery, skipping");
                continue;
            };

            let experiment = Experiment {
                id: record.id,
                name: record.name,
                operator: record.operator,
                part_metadata: record.part_metadata,
                post,
                batch_size: record.batch_size,
                aggregation_interval_secs: record.window_width_secs,
                checkpoint_interval_secs: record.checkpoint_interval_secs,
                selected_channels: record.selected_channels.clone(),
                started_at: record.started_at,
                ended_at: None,
            };
            let aggregator = Aggregator::new(record.started_at, experiment.aggregation_interval_secs, &record.selected_channels);
            let detector = AnomalyDetector::new(record.started_at, HashMap::new());
            self.posts.insert(post, PostRuntime { experiment, state: ExperimentState::Recovered, aggregator, detector });

            self.storage.log_state_transition_now(id, now, "running", "recovered", None)?;
            self.storage.log_state_transition_now(id, now, "recovered", "stopped", Some("process restart"))?;
            self.storage.set_experiment_status(id, "stopped", Some(now))?;
            if let Some(runtime) = self.posts.get_mut(&post) {
                runtime.state = ExperimentState::Stopped;
            }
            tracing::warn!(experiment_id = %id, post = ?post, "recovered stale running experiment, marked stopped");
        }
        Ok(())
    }

    fn require_state(&mut self, post: Post, expected: ExperimentState) -> Result<&mut PostRuntime> {
        let runtime = self.posts.get_mut(&post).ok_or(CoordinatorError::WrongState(post))?;
        if runtime.state != expected {
            return Err(CoordinatorError::WrongState(post));
        }
        Ok(runtime)
    }

    /// Fans out one decoded frame to every running post whose selected
    /// channels contain the sample (spec.md S4.11 "Channel routing").
    /// Paused posts receive no samples; a channel never belongs to more
    /// than one running post by construction of [`Self::start`].
    pub fn route_batch(&mut self, batch: &DecodedBatch) {
        for sample in &batch.samples {
            for (&post, runtime) in self.posts.iter_mut() {
                if runtime.state != ExperimentState::Running {
                    continue;
                }
                if !runtime.experiment.selected_channels.contains(&sample.channel_index) {
                    continue;
                }
                let timed = TimedSample {
                    channel_index: sample.channel_index,
                    value: sample.value,
                    timestamp: batch.timestamp,
                };
                for sub in &self.subscribers {
                    sub.on_sample(post, timed);
                }
                for window in runtime.aggregator.ingest(timed) {
                    for ev in runtime.detector.observe_window(&window) {
                        for sub in &self.subscribers {
                            sub.on_anomaly(post, ev.clone());
                        }
                        self.persist_queue.enqueue(PersistItem::AnomalyEvent {
                            experiment_id: runtime.experiment.id.clone(),
                            event: ev,
                        });
                    }
                    self.persist_queue.enqueue(PersistItem::AggregatedWindow {
                        experiment_id: runtime.experiment.id.clone(),
                        window_width_secs: runtime.experiment.aggregation_interval_secs,
                        window,
                    });
                }
                for ev in runtime.detector.ingest(timed) {
                    for sub in &self.subscribers {
                        sub.on_anomaly(post, ev.clone());
                    }
                    self.persist_queue.enqueue(PersistItem::AnomalyEvent {
                        experiment_id: runtime.experiment.id.clone(),
                        event: ev,
                    });
                }
            }
        }
    }

    /// Periodic driver for time-based emissions that don't depend on new
    /// samples: regular-grid window rolls and no-data timeouts.
    pub fn tick(&mut self, now: NaiveDateTime) {
        for (&post, runtime) in self.posts.iter_mut() {
            if runtime.state != ExperimentState::Running {
                continue;
            }
            for window in runtime.aggregator.tick(now) {
                for ev in runtime.detector.observe_window(&window) {
                    for sub in &self.subscribers {
                        sub.on_anomaly(post, ev.clone());
                    }
                    self.persist_queue.enqueue(PersistItem::AnomalyEvent {
                        experiment_id: runtime.experiment.id.clone(),
                        event: ev,
                    });
                }
                self.persist_queue.enqueue(PersistItem::AggregatedWindow {
                    experiment_id: runtime.experiment.id.clone(),
                    window_width_secs: runtime.experiment.aggregation_interval_secs,
                    window,
                });
            }
            for ev in runtime.detector.tick(now) {
                for sub in &self.subscribers {
                    sub.on_anomaly(post, ev.clone());
                }
                self.persist_queue.enqueue(PersistItem::AnomalyEvent {
                    experiment_id: runtime.experiment.id.clone(),
                    event: ev,
                });
            }
        }
    }

    /// Fills in the counters this coordinator owns directly (persist
    /// queue, quarantine) on top of the ingest/decode/decoder counters the
    /// caller supplies, then fans the complete snapshot out to every
    /// subscriber (spec.md S7: "all counters observable via a metrics
    /// snapshot").
    pub fn report_health(&self, external: HealthSnapshot) -> Result<()> {
        let snapshot = HealthSnapshot {
            persist_queue_depth: self.persist_queue.len(),
            persist_dropped: self.persist_queue.dropped_count(),
            quarantined_count: self.storage.quarantined_count()?,
            ..external
        };
        for sub in &self.subscribers {
            sub.on_health(snapshot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_store::Storage;
    use chrono::NaiveDate;

    fn t(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn experiment(post: Post, id: &str, channels: Vec<u16>) -> Experiment {
        Experiment {
            id: id.to_string(),
            name: "smoke".into(),
            operator: "op".into(),
            part_metadata: String::new(),
            post,
            batch_size: 500,
            aggregation_interval_secs: 20,
            checkpoint_interval_secs: 5,
            selected_channels: channels,
            started_at: t(0),
            ended_at: None,
        }
    }

    fn coordinator() -> ExperimentCoordinator {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let queue = Arc::new(BoundedQueue::new(100));
        ExperimentCoordinator::new(storage, queue)
    }

    #[test]
    fn start_rejects_overlapping_channel_on_another_running_post() {
        let mut coord = coordinator();
        coord.start(experiment(Post::A, "exp-a", vec![1, 2, 3]), HashMap::new()).unwrap();
        let result = coord.start(experiment(Post::B, "exp-b", vec![3, 4]), HashMap::new());
        assert!(matches!(result, Err(CoordinatorError::PostChannelConflict { channel: 3, .. })));
    }

    #[test]
    fn lifecycle_runs_through_stop_and_finalize() {
        let mut coord = coordinator();
        coord.start(experiment(Post::A, "exp-a", vec![1]), HashMap::new()).unwrap();
        assert_eq!(coord.state_of(Post::A), ExperimentState::Running);
        coord.stop(Post::A, t(100)).unwrap();
        assert_eq!(coord.state_of(Post::A), ExperimentState::Stopped);
        coord.finalize(Post::A, t(101)).unwrap();
        assert_eq!(coord.state_of(Post::A), ExperimentState::Finalized);
    }

    #[test]
    fn pause_then_resume_round_trips_state() {
        let mut coord = coordinator();
        coord.start(experiment(Post::A, "exp-a", vec![1]), HashMap::new()).unwrap();
        coord.pause(Post::A, t(10)).unwrap();
        assert_eq!(coord.state_of(Post::A), ExperimentState::Paused);
        coord.resume(Post::A, t(50)).unwrap();
        assert_eq!(coord.state_of(Post::A), ExperimentState::Running);
    }

    #[test]
    fn a_paused_post_still_holds_its_channel_lock() {
        let mut coord = coordinator();
        coord.start(experiment(Post::A, "exp-a", vec![1, 2]), HashMap::new()).unwrap();
        coord.pause(Post::A, t(10)).unwrap();
        let result = coord.start(experiment(Post::B, "exp-b", vec![2, 3]), HashMap::new());
        assert!(matches!(result, Err(CoordinatorError::PostChannelConflict { channel: 2, .. })));
    }

    #[test]
    fn resume_fails_if_another_post_claimed_the_channel_while_paused() {
        let mut coord = coordinator();
        coord.start(experiment(Post::A, "exp-a", vec![1]), HashMap::new()).unwrap();
        coord.pause(Post::A, t(10)).unwrap();

        // Force the conflicting claim past the `start` guard to simulate a
        // window where Post A's lock was not yet honored.
        coord.posts.remove(&Post::A);
        coord.start(experiment(Post::B, "exp-b", vec![1]), HashMap::new()).unwrap();
        coord.posts.insert(
            Post::A,
            PostRuntime {
                experiment: experiment(Post::A, "exp-a", vec![1]),
                state: ExperimentState::Paused,
                aggregator: Aggregator::new(t(0), 20, &[1]),
                detector: AnomalyDetector::new(t(0), HashMap::new()),
            },
        );

        let result = coord.resume(Post::A, t(50));
        assert!(matches!(result, Err(CoordinatorError::PostChannelConflict { channel: 1, .. })));
    }

    #[test]
    fn recover_marks_stale_running_experiment_stopped() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        storage
            .create_experiment(bench_store::NewExperiment {
                id: "stale-1",
                name: "stale",
                operator: "op",
                part_metadata: "",
                post: "A",
                batch_size: 500,
                window_width_secs: 20,
                checkpoint_interval_secs: 30,
                selected_channels: &[1],
                started_at: t(0),
            })
            .unwrap();
        storage.set_experiment_status("stale-1", "running", None).unwrap();
        let queue = Arc::new(BoundedQueue::new(100));
        let mut coord = ExperimentCoordinator::new(storage.clone(), queue);
        coord.recover(&["stale-1".to_string()], t(5)).unwrap();
        assert_eq!(storage.experiment_status("stale-1").unwrap().as_deref(), Some("stopped"));
    }

    #[test]
    fn channel_not_selected_by_any_post_is_dropped_silently() {
        let mut coord = coordinator();
        coord.start(experiment(Post::A, "exp-a", vec![1]), HashMap::new()).unwrap();
        let frame = bench_protocol::DecodedBatch {
            timestamp: t(1),
            sequence: 1,
            samples: vec![bench_protocol::DecodedSample { channel_index: 99, value: SampleValue::Valid(1.0) }],
        };
        coord.route_batch(&frame);
        // No channel 99 selected anywhere: nothing should be enqueued.
    }
}
