//! Table definitions for the embedded Store (spec.md S4.9).
//!
//! Aggregated-window samples are kept in one table per tumbling-window
//! width, named `agg_samples_<W>s`, so a query against a fixed window size
//! never has to filter a mixed-width table.

pub const CREATE_CORE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS experiments (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        operator TEXT NOT NULL,
        part_metadata TEXT NOT NULL,
        post TEXT NOT NULL,
        batch_size INTEGER NOT NULL,
        window_width_secs INTEGER NOT NULL,
        checkpoint_interval_secs INTEGER NOT NULL,
        selected_channels TEXT NOT NULL,
        started_at TEXT NOT NULL,
        stopped_at TEXT,
        status TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS anomaly_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        experiment_id TEXT NOT NULL,
        channel_index INTEGER NOT NULL,
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        at TEXT NOT NULL,
        restored INTEGER NOT NULL,
        value REAL,
        threshold REAL,
        delta REAL,
        message TEXT NOT NULL,
        end_time TEXT,
        acknowledged_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_anomaly_events_experiment
        ON anomaly_events(experiment_id, at);

    CREATE TABLE IF NOT EXISTS experiment_state_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        experiment_id TEXT NOT NULL,
        at TEXT NOT NULL,
        from_state TEXT NOT NULL,
        to_state TEXT NOT NULL,
        reason TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_state_log_experiment
        ON experiment_state_log(experiment_id, at);

    CREATE TABLE IF NOT EXISTS quarantined_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        payload TEXT NOT NULL,
        failed_at TEXT NOT NULL,
        error TEXT NOT NULL
    );
";

/// Table name for aggregated windows of the given width, e.g.
/// `agg_samples_20s`. `width_secs` always comes from `BenchConfig`, never
/// from untrusted input, so building the DDL/DML with `format!` is safe.
pub fn agg_table_name(width_secs: i64) -> String {
    format!("agg_samples_{width_secs}s")
}

/// `timestamp` holds the window's start (spec.md S4.10's aggregate
/// primary key is `(experiment_id, timestamp, channel_index)`, and the
/// export collaborator's documented read in spec.md S6.3 orders by this
/// column by name); `value_min`/`value_max`/`value_avg` are likewise
/// named for that same read contract's
/// `COALESCE(value_avg, value_max, value_min) IS NOT NULL` validity check.
pub fn create_agg_table_sql(width_secs: i64) -> String {
    let table = agg_table_name(width_secs);
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            experiment_id TEXT NOT NULL,
            channel_index INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            window_end TEXT NOT NULL,
            value_min REAL,
            value_max REAL,
            value_avg REAL,
            first REAL,
            last REAL,
            stddev REAL,
            sample_count INTEGER NOT NULL,
            invalid_count INTEGER NOT NULL,
            total_count INTEGER NOT NULL,
            quality TEXT NOT NULL,
            PRIMARY KEY (experiment_id, channel_index, timestamp)
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_experiment
            ON {table}(experiment_id, timestamp);"
    )
}
