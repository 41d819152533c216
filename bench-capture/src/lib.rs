//! Managed TCP client for the transmitter stream (spec.md S4.2).
//!
//! Owns the connect/read state machine and a single mutex-guarded counters
//! block. Read timeouts loop rather than error; a zero-length read or an
//! I/O error transitions state and ends the read loop. The caller supplies
//! the [`bench_pipeline::BoundedQueue`] raw chunks are pushed into.

use bench_pipeline::BoundedQueue;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("connect to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("not connected")]
    NotConnected,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Single mutex-guarded counters block (spec.md S4.2/S5: "guarded by a
/// single mutex").
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub bytes_per_second: f64,
    pub last_chunk_at: Option<Instant>,
}

struct StatsInner {
    stats: CaptureStats,
    window_start: Instant,
    window_bytes: u64,
}

/// Read buffer size for one socket read. The transmitter's frames are well
/// under this, so a single read typically carries one or more whole frames.
const READ_CHUNK_SIZE: usize = 8192;
const RATE_WINDOW: Duration = Duration::from_secs(1);

pub struct CaptureClient {
    state: Mutex<CaptureState>,
    stats: Mutex<StatsInner>,
    write_half: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    last_error: Mutex<Option<String>>,
}

impl Default for CaptureClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureClient {
    pub fn new() -> Self {
        CaptureClient {
            state: Mutex::new(CaptureState::Disconnected),
            stats: Mutex::new(StatsInner {
                stats: CaptureStats::default(),
                window_start: Instant::now(),
                window_bytes: 0,
            }),
            write_half: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.lock().stats
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Connects and then runs the read loop until the peer closes, an I/O
    /// error occurs, or `cancel` is signalled. Every complete read is
    /// pushed into `ingest`; a full ingest queue silently drops the chunk
    /// (spec.md S4.3), counted at the queue, not here.
    ///
    /// Cancellation is observed at most one read-timeout period late
    /// (spec.md S5).
    pub async fn run(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
        ingest: &BoundedQueue<Vec<u8>>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let stream = self.connect(host, port, connect_timeout).await?;
        let (mut read_half, write_half) = stream.into_split();
        *self.write_half.lock() = Some(write_half);
        self.set_state(CaptureState::Connected);

        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            if *cancel.borrow() {
                tracing::info!("capture read loop cancelled");
                self.set_state(CaptureState::Disconnected);
                return Ok(());
            }

            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        tracing::info!("capture read loop cancelled");
                        self.set_state(CaptureState::Disconnected);
                        return Ok(());
                    }
                }
                read_result = tokio::time::timeout(read_timeout, read_half.read(&mut buf)) => {
                    match read_result {
                        Err(_elapsed) => continue, // read timeout: non-fatal, loop
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "capture read error");
                            *self.last_error.lock() = Some(e.to_string());
                            self.set_state(CaptureState::Error);
                            return Err(CaptureError::Io(e));
                        }
                        Ok(Ok(0)) => {
                            tracing::info!("capture peer closed connection");
                            self.set_state(CaptureState::Disconnected);
                            return Ok(());
                        }
                        Ok(Ok(n)) => {
                            let chunk = buf[..n].to_vec();
                            self.record_chunk(n);
                            ingest.enqueue(chunk);
                        }
                    }
                }
            }
        }
    }

    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
        self.set_state(CaptureState::Connecting);
        let addr = format!("{host}:{port}");
        match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                self.set_state(CaptureState::Error);
                *self.last_error.lock() = Some(e.to_string());
                Err(CaptureError::Io(e))
            }
            Err(_elapsed) => {
                self.set_state(CaptureState::Error);
                Err(CaptureError::Timeout { addr, timeout })
            }
        }
    }

    /// Sends a line-oriented control command, CRLF-terminated per spec.md
    /// S6.1. Fails with `NotConnected` unless the write half is present.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut write_half = self.write_half.lock().take().ok_or(CaptureError::NotConnected)?;
        let result = write_half.write_all(bytes).await;
        *self.write_half.lock() = Some(write_half);
        result?;
        Ok(())
    }

    pub fn disconnect(&self) {
        *self.write_half.lock() = None;
        self.set_state(CaptureState::Disconnected);
    }

    /// Marks the client as about to retry a dropped connection. The caller
    /// drives the actual retry loop (spec.md S4.2: `Connected → Reconnecting`
    /// on a non-cancelled exit from [`Self::run`]); this just makes that
    /// intent observable via [`Self::state`].
    pub fn begin_reconnect(&self) {
        self.set_state(CaptureState::Reconnecting);
    }

    fn set_state(&self, new_state: CaptureState) {
        *self.state.lock() = new_state;
        tracing::info!(?new_state, "capture state transition");
    }

    fn record_chunk(&self, n: usize) {
        let mut inner = self.stats.lock();
        let now = Instant::now();
        inner.stats.total_bytes += n as u64;
        inner.stats.total_chunks += 1;
        inner.stats.last_chunk_at = Some(now);
        inner.window_bytes += n as u64;
        let elapsed = now.duration_since(inner.window_start);
        if elapsed >= RATE_WINDOW {
            inner.stats.bytes_per_second = inner.window_bytes as f64 / elapsed.as_secs_f64();
            inner.window_start = now;
            inner.window_bytes = 0;
        }
    }
}
