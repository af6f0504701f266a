use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use celltap_core::error::SinkError;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Side channel for write failures. Called on the worker thread.
pub type ErrorCallback = Arc<dyn Fn(&SinkError) + Send + Sync>;

enum WriteTask {
    Line(u64, Bytes),
    /// Resolves once every line queued before it has been processed.
    Barrier(oneshot::Sender<TraceMark>),
}

/// Position of the writer at a barrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceMark {
    /// File length once every earlier line was written. Zero for files that
    /// are not regular files.
    pub len: u64,
    /// Sequence number of the last line handled before the barrier, whether
    /// it was written or lost to a write error.
    pub through_seq: u64,
}

#[derive(Debug, Default)]
struct SinkCounters {
    lines_written: AtomicU64,
    write_errors: AtomicU64,
}

/// Point-in-time view of the sink's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub lines_written: u64,
    pub write_errors: u64,
}

struct Worker {
    tx: Sender<WriteTask>,
    handle: JoinHandle<()>,
    last_seq: u64,
}

/// Append-only trace file served by exactly one background writer thread.
///
/// `append` never touches the file itself: it only enqueues, so producers are
/// never blocked by disk latency and lines from concurrent producers can never
/// interleave.
pub struct WriteSink {
    path: PathBuf,
    worker: Mutex<Option<Worker>>,
    counters: Arc<SinkCounters>,
}

impl WriteSink {
    /// Open (or create) `path` for appending and start the writer thread.
    ///
    /// Missing parent directories are created. `worker_name` names the thread.
    pub fn open(path: impl AsRef<Path>, worker_name: &str) -> Result<Self, SinkError> {
        Self::open_with_callback(path, worker_name, Arc::new(log_sink_error))
    }

    pub fn open_with_callback(
        path: impl AsRef<Path>,
        worker_name: &str,
        on_error: ErrorCallback,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| SinkError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        // Only regular files can be cut back after a torn write.
        let end = file
            .metadata()
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len());

        let (tx, rx) = mpsc::channel();
        let counters = Arc::new(SinkCounters::default());
        let worker_counters = Arc::clone(&counters);
        let handle = thread::Builder::new()
            .name(worker_name.to_string())
            .spawn(move || run_worker(file, end, rx, worker_counters, on_error))
            .map_err(SinkError::Worker)?;

        debug!(path = %path.display(), worker = worker_name, "write sink opened");

        Ok(Self {
            path,
            worker: Mutex::new(Some(Worker {
                tx,
                handle,
                last_seq: 0,
            })),
            counters,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one line for writing.
    ///
    /// Returns the line's sequence number (starting at 1 and strictly
    /// increasing in file order), or `None` if the sink is closed.
    pub fn append(&self, line: impl Into<Bytes>) -> Option<u64> {
        let mut worker = self.worker.lock();
        let worker = worker.as_mut()?;
        worker.last_seq += 1;
        let seq = worker.last_seq;
        worker.tx.send(WriteTask::Line(seq, line.into())).ok()?;
        Some(seq)
    }

    /// Wait until everything appended so far has been written to the file.
    ///
    /// Returns [`SinkError::Closed`] if the sink was closed before the barrier
    /// could be processed.
    pub async fn flush(&self) -> Result<(), SinkError> {
        self.mark().await.map(|_| ())
    }

    /// Like [`flush`](Self::flush), but also reports how far the file and the
    /// line sequence had got at that point.
    pub async fn mark(&self) -> Result<TraceMark, SinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        let submitted = match self.worker.lock().as_ref() {
            Some(worker) => worker.tx.send(WriteTask::Barrier(done_tx)).is_ok(),
            None => false,
        };
        if !submitted {
            return Err(SinkError::Closed);
        }
        done_rx.await.map_err(|_| SinkError::Closed)
    }

    /// Drain pending writes, sync, and release the file. Later calls are no-ops.
    ///
    /// Blocks until the writer thread has finished.
    pub fn close(&self) {
        let Some(Worker { tx, handle, .. }) = self.worker.lock().take() else {
            return;
        };
        // Dropping the sender lets the worker drain the queue and exit.
        drop(tx);
        if handle.join().is_err() {
            warn!(path = %self.path.display(), "write worker panicked");
        }
        debug!(path = %self.path.display(), "write sink closed");
    }

    pub fn is_open(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            lines_written: self.counters.lines_written.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WriteSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn log_sink_error(err: &SinkError) {
    warn!("trace sink: {err}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer thread
// ─────────────────────────────────────────────────────────────────────────────

/// Where the writer thread puts its batches.
trait TraceFile: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl TraceFile for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write one batch. A failed batch is dropped, not retried: the trace gets a
/// gap. When the file length is known it is cut back to `end`, so a torn
/// line never prefixes the next batch.
fn write_batch<F: TraceFile>(
    file: &mut F,
    end: &mut Option<u64>,
    batch: &[u8],
) -> Result<(), SinkError> {
    match file.write_all(batch) {
        Ok(()) => {
            if let Some(end) = end.as_mut() {
                *end += batch.len() as u64;
            }
            Ok(())
        }
        Err(e) => {
            if let Some(len) = *end {
                if let Err(cut) = file.truncate_to(len) {
                    warn!("could not roll back torn batch: {cut}");
                    *end = None;
                }
            }
            Err(SinkError::Write(e))
        }
    }
}

fn run_worker(
    mut file: File,
    mut end: Option<u64>,
    rx: Receiver<WriteTask>,
    counters: Arc<SinkCounters>,
    on_error: ErrorCallback,
) {
    let report = |err: SinkError| {
        counters.write_errors.fetch_add(1, Ordering::Relaxed);
        on_error(&err);
    };

    let mut batch = Vec::new();
    let mut through_seq = 0u64;

    // Blocks until a task arrives; ends once every sender is gone and the
    // queue is empty.
    while let Ok(task) = rx.recv() {
        let mut barriers = Vec::new();
        let mut lines = 0u64;
        let mut next = Some(task);

        // Coalesce whatever is already queued behind this task into one write.
        while let Some(task) = next {
            match task {
                WriteTask::Line(seq, line) => {
                    batch.extend_from_slice(&line);
                    lines += 1;
                    through_seq = seq;
                }
                WriteTask::Barrier(done) => barriers.push(done),
            }
            next = rx.try_recv().ok();
        }

        if !batch.is_empty() {
            match write_batch(&mut file, &mut end, &batch) {
                Ok(()) => {
                    counters.lines_written.fetch_add(lines, Ordering::Relaxed);
                }
                Err(e) => report(e),
            }
            batch.clear();
        }
        let mark = TraceMark {
            len: end.unwrap_or(0),
            through_seq,
        };
        for done in barriers {
            let _ = done.send(mark);
        }
    }

    if let Err(e) = file.sync_data() {
        report(SinkError::Flush(e));
    }
}
