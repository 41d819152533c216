//! On-disk configuration (spec.md S6.2), loaded once at process start.
//!
//! Mirrors `toxxi::config::Config`'s shape: a `Default` impl plus a loader
//! that falls back to defaults on a missing or partially-specified file, so
//! a config file only needs to name the fields it overrides.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct TransmitterConfig {
    #[serde(default = "default_ip")]
    pub ip_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        TransmitterConfig {
            ip_address: default_ip(),
            port: default_port(),
            connection_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_sec")]
    pub flush_interval_sec: u64,
    /// How often the Batch Writer folds the WAL back into the main
    /// database file (spec.md S4.9 write-ahead checkpointing).
    #[serde(default = "default_checkpoint_interval_sec")]
    pub checkpoint_interval_sec: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            db_path: default_db_path(),
            batch_size: default_batch_size(),
            flush_interval_sec: default_flush_interval_sec(),
            checkpoint_interval_sec: default_checkpoint_interval_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_interval_sec")]
    pub interval_sec: i64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig { interval_sec: default_interval_sec() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineQueueSizes {
    #[serde(default = "default_ingest_capacity")]
    pub ingest: usize,
    #[serde(default = "default_decode_capacity")]
    pub decode: usize,
    #[serde(default = "default_persist_capacity")]
    pub persist: usize,
}

impl Default for PipelineQueueSizes {
    fn default() -> Self {
        PipelineQueueSizes {
            ingest: default_ingest_capacity(),
            decode: default_decode_capacity(),
            persist: default_persist_capacity(),
        }
    }
}

/// One `[[thresholds]]` table in the config file. Absent fields mean "rule
/// not configured" (spec.md S4.7: secondary critical limits and delta spike
/// are both optional per channel).
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelThresholdConfig {
    pub channel_index: u16,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_critical: Option<f64>,
    pub max_critical: Option<f64>,
    #[serde(default)]
    pub min_hysteresis: f64,
    #[serde(default)]
    pub max_hysteresis: f64,
    pub delta_spike: Option<f64>,
    #[serde(default = "default_debounce_samples")]
    pub debounce_samples: u32,
    #[serde(default = "default_no_data_timeout_sec")]
    pub no_data_timeout_sec: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub transmitter: TransmitterConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub pipeline: PipelineQueueSizes,
    #[serde(default)]
    pub thresholds: Vec<ChannelThresholdConfig>,
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_read_timeout_ms() -> u64 {
    1_000
}
fn default_db_path() -> String {
    "bench.sqlite3".to_string()
}
fn default_batch_size() -> usize {
    500
}
fn default_flush_interval_sec() -> u64 {
    1
}
fn default_checkpoint_interval_sec() -> u64 {
    30
}
fn default_interval_sec() -> i64 {
    20
}
fn default_debounce_samples() -> u32 {
    1
}
fn default_no_data_timeout_sec() -> i64 {
    30
}
fn default_ingest_capacity() -> usize {
    bench_pipeline::INGEST_QUEUE_CAPACITY
}
fn default_decode_capacity() -> usize {
    bench_pipeline::DECODE_QUEUE_CAPACITY
}
fn default_persist_capacity() -> usize {
    bench_pipeline::PERSIST_QUEUE_CAPACITY
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
}

/// Loads a `BenchConfig` from a TOML file. A missing file is not an error
/// at this layer — the caller decides whether to require one; an
/// unparsable file is always an error (spec.md S6.4 exit code 2).
pub fn load(path: &Path) -> Result<BenchConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_remaining_fields_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(&path, "[transmitter]\nip_address = \"10.0.0.5\"\nport = 7000\n").unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.transmitter.ip_address, "10.0.0.5");
        assert_eq!(cfg.transmitter.port, 7000);
        assert_eq!(cfg.transmitter.connection_timeout_ms, default_connect_timeout_ms());
        assert_eq!(cfg.database.batch_size, default_batch_size());
        assert_eq!(cfg.aggregation.interval_sec, default_interval_sec());
    }

    #[test]
    fn empty_file_yields_all_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(&path, "").unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.transmitter.port, default_port());
        assert_eq!(cfg.pipeline.ingest, bench_pipeline::INGEST_QUEUE_CAPACITY);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(matches!(load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn threshold_tables_parse_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(
            &path,
            "[[thresholds]]\nchannel_index = 20\nmin = 0.0\nmin_critical = -10.0\ndebounce_samples = 3\n",
        )
        .unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.thresholds.len(), 1);
        let t = &cfg.thresholds[0];
        assert_eq!(t.channel_index, 20);
        assert_eq!(t.min, Some(0.0));
        assert_eq!(t.min_critical, Some(-10.0));
        assert_eq!(t.debounce_samples, 3);
        assert_eq!(t.no_data_timeout_sec, default_no_data_timeout_sec());
        assert_eq!(t.min_hysteresis, 0.0);
    }
}
