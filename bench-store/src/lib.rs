//! Embedded relational storage and the batching layer that writes to it
//! (spec.md S4.9: Store and Batch Writer).

mod error;
pub mod schema;

pub use error::{BenchStoreError, Result};

use bench_aggregate::{AggregatedWindow, Quality};
use bench_anomaly::{AnomalyEvent, AnomalyKind, Severity};
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

/// Formats a timestamp so that lexical and chronological order agree:
/// `YYYY-MM-DD HH:MM:SS.fffffff`, a 7-digit fraction in 100ns ticks, no
/// timezone suffix (spec.md S4.10).
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    let ticks = ts.and_utc().timestamp_subsec_nanos() / 100;
    format!("{}.{:07}", ts.format("%Y-%m-%d %H:%M:%S"), ticks)
}

fn quality_str(q: Quality) -> &'static str {
    match q {
        Quality::Ok => "ok",
        Quality::Degraded => "degraded",
        Quality::Bad => "bad",
    }
}

fn kind_str(k: AnomalyKind) -> &'static str {
    match k {
        AnomalyKind::MinViolation => "min_violation",
        AnomalyKind::MaxViolation => "max_violation",
        AnomalyKind::DeltaSpike => "delta_spike",
        AnomalyKind::NoData => "no_data",
        AnomalyKind::QualityDegraded => "quality_degraded",
        AnomalyKind::QualityBad => "quality_bad",
    }
}

fn severity_str(s: Severity) -> &'static str {
    match s {
        Severity::Warning => "warning",
        Severity::Critical => "critical",
    }
}

/// One unit of work accepted by the Persist Queue and flushed to the
/// Store by the [`BatchWriter`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum PersistItem {
    AggregatedWindow {
        experiment_id: String,
        window_width_secs: i64,
        window: AggregatedWindow,
    },
    AnomalyEvent {
        experiment_id: String,
        event: AnomalyEvent,
    },
    StateTransition {
        experiment_id: String,
        at: NaiveDateTime,
        from_state: String,
        to_state: String,
        reason: Option<String>,
    },
}

/// A new or resumed experiment row (spec.md S3 Experiment attributes).
/// Borrows its string fields since it's only ever used for the duration
/// of one `create_experiment` call.
#[derive(Debug, Clone, Copy)]
pub struct NewExperiment<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub operator: &'a str,
    pub part_metadata: &'a str,
    pub post: &'a str,
    pub batch_size: usize,
    pub window_width_secs: i64,
    pub checkpoint_interval_secs: i64,
    pub selected_channels: &'a [u16],
    pub started_at: NaiveDateTime,
}

/// Owned counterpart of [`NewExperiment`], returned by
/// [`Storage::experiment_record`] for rebuilding a runtime after restart.
#[derive(Debug, Clone)]
pub struct ExperimentRecord {
    pub id: String,
    pub name: String,
    pub operator: String,
    pub part_metadata: String,
    pub post: String,
    pub batch_size: usize,
    pub window_width_secs: i64,
    pub checkpoint_interval_secs: i64,
    pub selected_channels: Vec<u16>,
    pub started_at: NaiveDateTime,
}

fn encode_channels(channels: &[u16]) -> String {
    channels.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",")
}

fn decode_channels(encoded: &str) -> Vec<u16> {
    encoded.split(',').filter(|s| !s.is_empty()).filter_map(|s| s.parse().ok()).collect()
}

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        conn.execute_batch(schema::CREATE_CORE_TABLES)?;
        Ok(Storage { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::CREATE_CORE_TABLES)?;
        Ok(Storage { conn: Mutex::new(conn) })
    }

    pub fn ensure_agg_table(&self, window_width_secs: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&schema::create_agg_table_sql(window_width_secs))?;
        Ok(())
    }

    pub fn create_experiment(&self, new: NewExperiment) -> Result<()> {
        self.ensure_agg_table(new.window_width_secs)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO experiments
                (id, name, operator, part_metadata, post, batch_size, window_width_secs,
                 checkpoint_interval_secs, selected_channels, started_at, stopped_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, 'running')
             ON CONFLICT(id) DO UPDATE SET
                name = ?2, operator = ?3, part_metadata = ?4, post = ?5, batch_size = ?6,
                window_width_secs = ?7, checkpoint_interval_secs = ?8, selected_channels = ?9,
                started_at = ?10",
            params![
                new.id,
                new.name,
                new.operator,
                new.part_metadata,
                new.post,
                new.batch_size,
                new.window_width_secs,
                new.checkpoint_interval_secs,
                encode_channels(new.selected_channels),
                format_timestamp(new.started_at),
            ],
        )?;
        Ok(())
    }

    /// Reads back everything needed to rebuild a post's runtime after a
    /// restart (spec.md S4.11 `recover()`): which post and channels the
    /// stale experiment owned, not just its id and status.
    pub fn experiment_record(&self, id: &str) -> Result<Option<ExperimentRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, operator, part_metadata, post, batch_size, window_width_secs,
                        checkpoint_interval_secs, selected_channels, started_at
                 FROM experiments WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, i64>(5)?,
                        r.get::<_, i64>(6)?,
                        r.get::<_, i64>(7)?,
                        r.get::<_, String>(8)?,
                        r.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, name, operator, part_metadata, post, batch_size, window_width_secs, checkpoint_interval_secs, selected_channels, started_at)) = row
        else {
            return Ok(None);
        };
        let started_at = NaiveDateTime::parse_from_str(&started_at, "%Y-%m-%d %H:%M:%S%.f")
            .map_err(|e| BenchStoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        Ok(Some(ExperimentRecord {
            id,
            name,
            operator,
            part_metadata,
            post,
            batch_size: batch_size as usize,
            window_width_secs,
            checkpoint_interval_secs,
            selected_channels: decode_channels(&selected_channels),
            started_at,
        }))
    }

    pub fn set_experiment_status(&self, id: &str, status: &str, at: Option<NaiveDateTime>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE experiments SET status = ?2, stopped_at = COALESCE(?3, stopped_at) WHERE id = ?1",
            params![id, status, at.map(format_timestamp)],
        )?;
        Ok(())
    }

    /// Ids of all experiments the Store believes are still Running, used
    /// by the Experiment Coordinator's startup recovery pass (spec.md
    /// S4.11 `recover()`).
    pub fn running_experiment_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM experiments WHERE status = 'running'")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn experiment_status(&self, id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let status = conn
            .query_row("SELECT status FROM experiments WHERE id = ?1", params![id], |r| r.get(0))
            .optional()?;
        Ok(status)
    }

    fn upsert_window(&self, conn: &Connection, experiment_id: &str, width_secs: i64, window: &AggregatedWindow) -> Result<()> {
        let table = schema::agg_table_name(width_secs);
        let sql = format!(
            "INSERT INTO {table}
                (experiment_id, channel_index, timestamp, window_end, value_min, value_max, value_avg, first, last,
                 stddev, sample_count, invalid_count, total_count, quality)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(experiment_id, channel_index, timestamp) DO UPDATE SET
                window_end = ?4, value_min = ?5, value_max = ?6, value_avg = ?7, first = ?8, last = ?9,
                stddev = ?10, sample_count = ?11, invalid_count = ?12, total_count = ?13, quality = ?14"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        stmt.execute(params![
            experiment_id,
            window.channel_index,
            format_timestamp(window.window_start),
            format_timestamp(window.window_end),
            window.min,
            window.max,
            window.avg,
            window.first,
            window.last,
            window.stddev,
            window.sample_count,
            window.invalid_count,
            window.total_count,
            quality_str(window.quality),
        ])?;
        Ok(())
    }

    fn insert_anomaly(&self, conn: &Connection, experiment_id: &str, event: &AnomalyEvent) -> Result<()> {
        conn.execute(
            "INSERT INTO anomaly_events
                (experiment_id, channel_index, kind, severity, at, restored, value, threshold, delta, message, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                experiment_id,
                event.channel_index,
                kind_str(event.kind),
                severity_str(event.severity),
                format_timestamp(event.at),
                event.restored,
                event.value,
                event.threshold,
                event.delta,
                event.message,
                event.end_time.map(format_timestamp),
            ],
        )?;
        Ok(())
    }

    /// Records an operator acknowledgement against the most recent
    /// unacknowledged event for `(experiment_id, channel_index, kind)`.
    /// Acknowledgement is an optional attribute of the Anomaly Event data
    /// model (spec.md S3); the UI that would normally drive it is out of
    /// scope (spec.md S1 Non-goals), so this is the core's entire surface
    /// for the feature.
    pub fn acknowledge_latest_anomaly(
        &self,
        experiment_id: &str,
        channel_index: u16,
        kind: AnomalyKind,
        at: NaiveDateTime,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE anomaly_events SET acknowledged_at = ?1
             WHERE id = (
                SELECT id FROM anomaly_events
                WHERE experiment_id = ?2 AND channel_index = ?3 AND kind = ?4 AND acknowledged_at IS NULL
                ORDER BY id DESC LIMIT 1
             )",
            params![format_timestamp(at), experiment_id, channel_index, kind_str(kind)],
        )?;
        Ok(updated > 0)
    }

    /// Runs a passive WAL checkpoint, folding durable WAL frames back into
    /// the main database file without blocking concurrent readers
    /// (spec.md S4.9: Batch Writer "handles write-ahead checkpointing").
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn insert_state_transition(
        &self,
        conn: &Connection,
        experiment_id: &str,
        at: NaiveDateTime,
        from_state: &str,
        to_state: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO experiment_state_log (experiment_id, at, from_state, to_state, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![experiment_id, format_timestamp(at), from_state, to_state, reason],
        )?;
        Ok(())
    }

    /// Writes an entire batch inside one transaction. All-or-nothing: a
    /// single malformed item rolls the whole batch back, which is what
    /// lets the caller retry it wholesale.
    pub fn write_batch(&self, items: &[PersistItem]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for item in items {
            match item {
                PersistItem::AggregatedWindow { experiment_id, window_width_secs, window } => {
                    self.upsert_window(&tx, experiment_id, *window_width_secs, window)?;
                }
                PersistItem::AnomalyEvent { experiment_id, event } => {
                    self.insert_anomaly(&tx, experiment_id, event)?;
                }
                PersistItem::StateTransition { experiment_id, at, from_state, to_state, reason } => {
                    self.insert_state_transition(&tx, experiment_id, *at, from_state, to_state, reason.as_deref())?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn quarantine(&self, payload_json: &str, failed_at: NaiveDateTime, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO quarantined_items (payload, failed_at, error) VALUES (?1, ?2, ?3)",
            params![payload_json, format_timestamp(failed_at), error],
        )?;
        Ok(())
    }

    pub fn quarantined_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM quarantined_items", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Total database size in bytes, including WAL-backed pages not yet
    /// checkpointed into the main file.
    pub fn size_bytes(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok((page_count * page_size).max(0) as u64)
    }

    /// Appends a row to `experiment_state_log` outside of a batch, for
    /// callers (the Experiment Coordinator) that need the write to be
    /// durable immediately rather than queued.
    pub fn log_state_transition_now(
        &self,
        experiment_id: &str,
        at: NaiveDateTime,
        from_state: &str,
        to_state: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        self.insert_state_transition(&conn, experiment_id, at, from_state, to_state, reason)
    }

    /// Replays the most recent state-log row for an experiment, used by
    /// recovery on startup (spec.md S4.11 `Recovered`).
    pub fn last_state_transition(&self, experiment_id: &str) -> Result<Option<(NaiveDateTime, String)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT at, to_state FROM experiment_state_log
                 WHERE experiment_id = ?1 ORDER BY id DESC LIMIT 1",
                params![experiment_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            Some((at, to_state)) => {
                let parsed = NaiveDateTime::parse_from_str(&at, "%Y-%m-%d %H:%M:%S%.f")
                    .map_err(|e| BenchStoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
                Ok(Some((parsed, to_state)))
            }
            None => Ok(None),
        }
    }
}

/// Tuning for the Batch Writer. The caller (the Experiment Coordinator's
/// persist task) owns the actual size/time trigger loop over the Persist
/// Queue; this config only bounds one `flush` call's retry behavior.
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub max_retries: u32,
    pub backoff_base: std::time::Duration,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        BatchWriterConfig {
            max_retries: 3,
            backoff_base: std::time::Duration::from_millis(200),
        }
    }
}

pub const DEFAULT_MAX_BATCH_ITEMS: usize = 200;
pub const DEFAULT_MAX_BATCH_INTERVAL_SECS: i64 = 2;

pub struct BatchWriter {
    storage: std::sync::Arc<Storage>,
    config: BatchWriterConfig,
}

impl BatchWriter {
    pub fn new(storage: std::sync::Arc<Storage>, config: BatchWriterConfig) -> Self {
        BatchWriter { storage, config }
    }

    /// Flushes one batch inside a single transaction, retrying with
    /// exponential backoff on failure (spec.md S4.9). After `max_retries`
    /// the batch is quarantined item-by-item so one bad row never blocks
    /// the pipeline forever.
    pub fn flush(&self, items: &[PersistItem], now: NaiveDateTime) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut attempt = 0u32;
        loop {
            match self.storage.write_batch(items) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(error = %e, batch_len = items.len(), attempt, "batch write failed, quarantining");
                        self.quarantine_batch(items, now, &e);
                        return Err(e);
                    }
                    tracing::warn!(error = %e, attempt, "batch write failed, retrying after backoff");
                    std::thread::sleep(self.config.backoff_base * 2u32.pow(attempt - 1));
                }
            }
        }
    }

    fn quarantine_batch(&self, items: &[PersistItem], now: NaiveDateTime, error: &BenchStoreError) {
        for item in items {
            match serde_json::to_string(item) {
                Ok(json) => {
                    if let Err(store_err) = self.storage.quarantine(&json, now, &error.to_string()) {
                        tracing::error!(error = %store_err, "failed to quarantine item, dropping");
                    }
                }
                Err(json_err) => {
                    tracing::error!(error = %json_err, "failed to serialize item for quarantine, dropping");
                }
            }
        }
    }
}
