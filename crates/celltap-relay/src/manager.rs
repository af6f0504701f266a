use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use celltap_core::codec::{LineCodec, RecordCodec};
use celltap_core::error::{SinkError, StartupError};
use celltap_core::record::{CapturedRecord, CellInfoEntry, Direction, TelemetryRecord};
use celltap_storage::WriteSink;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::listener::{Backlog, BacklogFuture, BacklogSource, ConnectionListener, ListenerState};
use crate::settings::RelaySettings;

/// Counters across the manager and whichever sinks are currently open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// `add_data` calls since construction.
    pub records: u64,
    /// Lines written by the current trace file (reset on each `listen`).
    pub lines_written: u64,
    pub write_errors: u64,
    pub connections_accepted: u64,
    pub lines_sent: u64,
    pub lines_dropped: u64,
}

/// Orchestrates one capture relay: caches the latest record, persists every
/// record to the trace file and streams it to the connected observer.
pub struct CaptureManager {
    queue_name: String,
    log_prefix: String,
    tweak_name: String,
    cache_file: PathBuf,
    settings: RelaySettings,
    codec: Arc<dyn RecordCodec>,
    last: Mutex<Option<CapturedRecord>>,
    sink: Mutex<Option<Arc<WriteSink>>>,
    listener: ConnectionListener,
    lifecycle: tokio::sync::Mutex<()>,
    records: AtomicU64,
}

impl CaptureManager {
    /// Create an idle manager. Nothing is opened until [`listen`](Self::listen).
    ///
    /// `queue_name` names the trace writer thread; `log_prefix` and
    /// `tweak_name` identify this relay in log output.
    pub fn new(
        queue_name: impl Into<String>,
        log_prefix: impl Into<String>,
        tweak_name: impl Into<String>,
        cache_file_name: impl Into<PathBuf>,
    ) -> Self {
        let settings = RelaySettings::default();
        Self {
            queue_name: queue_name.into(),
            log_prefix: log_prefix.into(),
            tweak_name: tweak_name.into(),
            cache_file: cache_file_name.into(),
            listener: ConnectionListener::new(settings.outbox_capacity),
            settings,
            codec: Arc::new(LineCodec),
            last: Mutex::new(None),
            sink: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            records: AtomicU64::new(0),
        }
    }

    pub fn with_settings(mut self, settings: RelaySettings) -> Self {
        self.listener = ConnectionListener::new(settings.outbox_capacity);
        self.settings = settings;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn RecordCodec>) -> Self {
        self.codec = codec;
        self
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Open the trace file and start accepting an observer on `port`.
    ///
    /// The trace file is in place before the first observer can connect, so
    /// both always see the same lines. If binding fails the trace file is
    /// closed again and the manager stays idle. Calling this while already
    /// listening returns the current address.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, StartupError> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(addr) = self.listener.local_addr() {
            self.log(format_args!("already listening on {addr}"));
            return Ok(addr);
        }

        let sink = Arc::new(self.open_sink()?);
        *self.sink.lock() = Some(Arc::clone(&sink));
        if self.settings.replay_on_connect {
            self.listener
                .set_backlog(Some(Arc::new(TraceBacklog { sink: Arc::clone(&sink) })));
        }

        let addr = SocketAddr::new(self.settings.bind_addr, port);
        match self.listener.listen(addr).await {
            Ok(local_addr) => {
                self.log(format_args!(
                    "listening on {local_addr}, tracing to {}",
                    self.cache_path().display()
                ));
                Ok(local_addr)
            }
            Err(e) => {
                warn!(tweak = %self.tweak_name, prefix = %self.log_prefix, "{e}");
                self.listener.set_backlog(None);
                self.sink.lock().take();
                close_sink(sink).await;
                Err(e.into())
            }
        }
    }

    /// Stop the listener, then drain and close the trace file. Idempotent.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.listener.close().await;
        self.listener.set_backlog(None);
        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            close_sink(sink).await;
            self.log("closed");
        }
    }

    // ── Producer API ────────────────────────────────────────────────────────

    /// Cache `record`, then hand its encoded line to the trace file and the
    /// observer. Never blocks on disk or network I/O.
    pub fn add_data(&self, record: TelemetryRecord) {
        let mut last = self.last.lock();
        let captured = last.insert(CapturedRecord::new(SystemTime::now(), record));
        let line = Bytes::from(self.codec.encode(captured));

        let seq = self
            .sink
            .lock()
            .as_ref()
            .and_then(|sink| sink.append(line.clone()));
        match seq {
            Some(seq) => self.listener.send_sequenced(line, seq),
            None => self.listener.send(line),
        };
        self.records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cells(&self, legacy_info: Vec<CellInfoEntry>) {
        self.add_data(TelemetryRecord::cells(legacy_info));
    }

    pub fn add_packet(
        &self,
        payload: impl Into<Bytes>,
        protocol: impl Into<String>,
        direction: Direction,
    ) {
        self.add_data(TelemetryRecord::packet(payload, protocol, direction));
    }

    // ── Diagnostics ─────────────────────────────────────────────────────────

    /// Log a diagnostic message tagged with this relay's identity.
    pub fn log(&self, message: impl fmt::Display) {
        info!(tweak = %self.tweak_name, prefix = %self.log_prefix, "{message}");
    }

    /// The most recently captured record, if any.
    pub fn last_capture(&self) -> Option<CapturedRecord> {
        self.last.lock().clone()
    }

    pub fn has_data(&self) -> bool {
        self.last.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_listening(&self) -> bool {
        self.listener.local_addr().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.listener.subscribe()
    }

    pub fn cache_path(&self) -> PathBuf {
        match &self.settings.cache_dir {
            Some(dir) if self.cache_file.is_relative() => dir.join(&self.cache_file),
            _ => self.cache_file.clone(),
        }
    }

    /// Wait until every record added so far has reached the trace file.
    pub async fn flush_trace(&self) -> Result<(), SinkError> {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.flush().await,
            None => Err(SinkError::Closed),
        }
    }

    pub fn stats(&self) -> RelayStats {
        let sink = self
            .sink
            .lock()
            .as_ref()
            .map(|sink| sink.stats())
            .unwrap_or_default();
        let listener = self.listener.stats();
        RelayStats {
            records: self.records.load(Ordering::Relaxed),
            lines_written: sink.lines_written,
            write_errors: sink.write_errors,
            connections_accepted: listener.connections_accepted,
            lines_sent: listener.lines_sent,
            lines_dropped: listener.lines_dropped,
        }
    }

    pub fn tweak_name(&self) -> &str {
        &self.tweak_name
    }

    fn open_sink(&self) -> Result<WriteSink, SinkError> {
        let path = self.cache_path();
        let tweak = self.tweak_name.clone();
        let prefix = self.log_prefix.clone();
        WriteSink::open_with_callback(
            &path,
            &self.queue_name,
            Arc::new(move |err| {
                warn!(tweak = %tweak, prefix = %prefix, "trace write failed: {err}");
            }),
        )
        .inspect_err(|e| warn!(tweak = %self.tweak_name, prefix = %self.log_prefix, "{e}"))
    }
}

/// Backlog for a new observer: the trace file up to the writer's current
/// position.
struct TraceBacklog {
    sink: Arc<WriteSink>,
}

impl BacklogSource for TraceBacklog {
    fn backlog(&self) -> BacklogFuture {
        let sink = Arc::clone(&self.sink);
        Box::pin(async move {
            let mark = sink.mark().await.map_err(io::Error::other)?;
            let file = tokio::fs::File::open(sink.path()).await?;
            let mut bytes = Vec::new();
            file.take(mark.len).read_to_end(&mut bytes).await?;
            Ok(Backlog {
                bytes: bytes.into(),
                through_seq: mark.through_seq,
            })
        })
    }
}

/// Close a sink off the async runtime, since closing joins its writer thread.
async fn close_sink(sink: Arc<WriteSink>) {
    let path: PathBuf = sink.path().to_path_buf();
    if let Err(e) = tokio::task::spawn_blocking(move || sink.close()).await {
        warn!(path = %path.display(), "closing trace file failed: {e}");
    }
}

impl fmt::Debug for CaptureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureManager")
            .field("tweak_name", &self.tweak_name)
            .field("cache_file", &self.cache_file)
            .field("state", &self.listener.state())
            .finish()
    }
}
