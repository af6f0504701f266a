use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use celltap_core::error::{BindError, PeerError};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines buffered per observer before the oldest ones are dropped.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of a [`ConnectionListener`], published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening {
        local_addr: SocketAddr,
    },
    Connected {
        local_addr: SocketAddr,
        peer: SocketAddr,
        connection_id: u64,
    },
}

impl ListenerState {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Idle => None,
            Self::Listening { local_addr } | Self::Connected { local_addr, .. } => {
                Some(*local_addr)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub connections_accepted: u64,
    pub lines_sent: u64,
    pub lines_dropped: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Backlog
// ─────────────────────────────────────────────────────────────────────────────

/// Data written to a new observer before any live line.
#[derive(Debug, Clone, Default)]
pub struct Backlog {
    pub bytes: Bytes,
    /// Live lines sent with a sequence number at or below this are already
    /// part of `bytes` and are skipped.
    pub through_seq: u64,
}

pub type BacklogFuture = Pin<Box<dyn Future<Output = io::Result<Backlog>> + Send>>;

/// Produces the backlog for each newly accepted connection.
pub trait BacklogSource: Send + Sync {
    fn backlog(&self) -> BacklogFuture;
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbox
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded per-connection send queue. When full, the oldest line is dropped so
/// a stalled observer can never hold back the producer.
struct Outbox {
    lines: Mutex<VecDeque<(Option<u64>, Bytes)>>,
    capacity: usize,
    ready: Notify,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            ready: Notify::new(),
        }
    }

    /// Enqueue a line; returns `true` if an older line had to be dropped.
    fn push(&self, seq: Option<u64>, line: Bytes) -> bool {
        let dropped = {
            let mut lines = self.lines.lock();
            let dropped = lines.len() >= self.capacity && lines.pop_front().is_some();
            lines.push_back((seq, line));
            dropped
        };
        self.ready.notify_one();
        dropped
    }

    fn pop(&self) -> Option<(Option<u64>, Bytes)> {
        self.lines.lock().pop_front()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────────────────────────

struct ActiveConnection {
    id: u64,
    peer: SocketAddr,
    outbox: Arc<Outbox>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    current: Mutex<Option<ActiveConnection>>,
    backlog: Mutex<Option<Arc<dyn BacklogSource>>>,
    state: watch::Sender<ListenerState>,
    outbox_capacity: usize,
    next_id: AtomicU64,
    connections_accepted: AtomicU64,
    lines_sent: AtomicU64,
    lines_dropped: AtomicU64,
}

struct AcceptLoop {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Loopback listener that serves at most one observer at a time.
///
/// A newly accepted connection always replaces the current one. Sends are
/// fire-and-forget: they enqueue onto the active connection's outbox and return
/// immediately, whether or not anyone is connected.
pub struct ConnectionListener {
    shared: Arc<Shared>,
    accept: tokio::sync::Mutex<Option<AcceptLoop>>,
}

impl ConnectionListener {
    pub fn new(outbox_capacity: usize) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            shared: Arc::new(Shared {
                current: Mutex::new(None),
                backlog: Mutex::new(None),
                state,
                outbox_capacity,
                next_id: AtomicU64::new(0),
                connections_accepted: AtomicU64::new(0),
                lines_sent: AtomicU64::new(0),
                lines_dropped: AtomicU64::new(0),
            }),
            accept: tokio::sync::Mutex::new(None),
        }
    }

    /// Bind `addr` and start accepting observers.
    ///
    /// Returns the bound address (useful with port 0). Calling this while
    /// already listening is a no-op that returns the existing address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, BindError> {
        let mut accept = self.accept.lock().await;
        if let Some(running) = accept.as_ref() {
            debug!(local_addr = %running.local_addr, "already listening");
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BindError { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BindError { addr, source })?;

        self.shared
            .state
            .send_replace(ListenerState::Listening { local_addr });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            local_addr,
            Arc::clone(&self.shared),
            shutdown_rx,
        ));

        *accept = Some(AcceptLoop {
            local_addr,
            shutdown_tx,
            task,
        });
        info!(%local_addr, "listening for observers");
        Ok(local_addr)
    }

    /// Queue `line` for the active observer, if any.
    ///
    /// Returns `true` if there was a connection to queue it on. Never blocks on
    /// the network.
    pub fn send(&self, line: Bytes) -> bool {
        self.push(None, line)
    }

    /// Like [`send`](Self::send), for a line the backlog source numbered
    /// `seq`. The line is skipped if the connection's backlog already has it.
    pub fn send_sequenced(&self, line: Bytes, seq: u64) -> bool {
        self.push(Some(seq), line)
    }

    /// Hand every connection accepted from now on a backlog from `source`
    /// before live lines. `None` turns this off.
    pub fn set_backlog(&self, source: Option<Arc<dyn BacklogSource>>) {
        *self.shared.backlog.lock() = source;
    }

    fn push(&self, seq: Option<u64>, line: Bytes) -> bool {
        let current = self.shared.current.lock();
        let Some(conn) = current.as_ref() else {
            return false;
        };
        if conn.outbox.push(seq, line) {
            self.shared.lines_dropped.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Stop accepting, close the active connection and release the socket.
    ///
    /// Returns once the listening socket is gone, so the port can be bound again
    /// right away. Calling this when idle is a no-op.
    pub async fn close(&self) {
        let mut accept = self.accept.lock().await;
        let Some(running) = accept.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.task.await {
            warn!("accept loop ended abnormally: {e}");
        }

        let active = self.shared.current.lock().take();
        if let Some(conn) = active {
            conn.cancel.cancel();
            let _ = conn.task.await;
        }

        self.shared.state.send_replace(ListenerState::Idle);
        info!(local_addr = %running.local_addr, "stopped listening");
    }

    pub fn state(&self) -> ListenerState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.shared.state.subscribe()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.borrow().local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().is_connected()
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            connections_accepted: self.shared.connections_accepted.load(Ordering::Relaxed),
            lines_sent: self.shared.lines_sent.load(Ordering::Relaxed),
            lines_dropped: self.shared.lines_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionListener {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        // The accept loop stops on its own once its shutdown sender is dropped.
        if let Some(conn) = self.shared.current.lock().take() {
            conn.cancel.cancel();
        }
    }
}

impl Shared {
    /// Make a freshly accepted stream the active connection, closing the old one.
    fn install(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, local_addr: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {e}");
        }

        let outbox = Arc::new(Outbox::new(self.outbox_capacity));
        let cancel = CancellationToken::new();
        let backlog = self.backlog.lock().clone();

        let previous = {
            // Registered under the lock so the task's own cleanup cannot run first.
            let mut current = self.current.lock();
            let task = tokio::spawn(serve_connection(
                Arc::clone(self),
                id,
                peer,
                stream,
                Arc::clone(&outbox),
                backlog,
                cancel.clone(),
            ));
            let previous = current.replace(ActiveConnection {
                id,
                peer,
                outbox,
                cancel,
                task,
            });
            self.state.send_replace(ListenerState::Connected {
                local_addr,
                peer,
                connection_id: id,
            });
            previous
        };

        match previous {
            Some(old) => {
                info!(%peer, replaced = %old.peer, "observer connected, replacing previous");
                old.cancel.cancel();
            }
            None => info!(%peer, "observer connected"),
        }
    }

    /// Forget connection `id` if it is still the active one.
    fn release(&self, id: u64) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| c.id == id) {
            current.take();
            self.state.send_modify(|state| {
                if let ListenerState::Connected { local_addr, .. } = *state {
                    *state = ListenerState::Listening { local_addr };
                }
            });
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => shared.install(stream, peer, local_addr),
                Err(e) => {
                    warn!(%local_addr, "accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    debug!(%local_addr, "accept loop stopped");
}

/// Serve one observer until it goes away or the connection is cancelled,
/// then release its slot.
async fn serve_connection(
    shared: Arc<Shared>,
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    outbox: Arc<Outbox>,
    backlog: Option<Arc<dyn BacklogSource>>,
    cancel: CancellationToken,
) {
    let failure = pump(&shared, peer, stream, &outbox, backlog, &cancel).await;

    shared.release(id);
    match failure {
        Some(err) => info!(%peer, connection_id = id, "observer gone: {err}"),
        None => debug!(%peer, connection_id = id, "observer connection closed"),
    }
    // Dropping both halves shuts the socket down.
}

/// Write the backlog, then pump the outbox into the socket. Anything the
/// observer sends is read and discarded. Returns why the connection ended,
/// or `None` if it was cancelled.
async fn pump(
    shared: &Shared,
    peer: SocketAddr,
    stream: TcpStream,
    outbox: &Outbox,
    backlog: Option<Arc<dyn BacklogSource>>,
    cancel: &CancellationToken,
) -> Option<PeerError> {
    let (mut reader, mut writer) = stream.into_split();
    let mut scratch = [0u8; 512];

    let mut skip_through = 0;
    if let Some(source) = backlog {
        let backlog = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            backlog = source.backlog() => backlog,
        };
        match backlog {
            Ok(backlog) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    written = writer.write_all(&backlog.bytes) => {
                        if let Err(source) = written {
                            return Some(PeerError::Send { peer, source });
                        }
                    }
                }
                debug!(%peer, bytes = backlog.bytes.len(), "backlog sent");
                skip_through = backlog.through_seq;
            }
            Err(e) => warn!(%peer, "backlog unavailable, sending live lines only: {e}"),
        }
    }

    // Queued lines go out before the socket is read again, so an observer
    // that keeps talking cannot starve the write path.
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = outbox.ready.notified() => {
                match drain(&mut writer, outbox, shared, skip_through, cancel).await {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(source) => return Some(PeerError::Send { peer, source }),
                }
            }
            read = reader.read(&mut scratch) => match read {
                Ok(0) => return Some(PeerError::Closed { peer }),
                Ok(_) => {}
                Err(source) => return Some(PeerError::Read { peer, source }),
            },
        }
    }
}

/// Write queued lines until the outbox is empty. Returns `Ok(false)` if the
/// connection was cancelled part way.
async fn drain(
    writer: &mut OwnedWriteHalf,
    outbox: &Outbox,
    shared: &Shared,
    skip_through: u64,
    cancel: &CancellationToken,
) -> io::Result<bool> {
    while let Some((seq, line)) = outbox.pop() {
        if seq.is_some_and(|seq| seq <= skip_through) {
            continue;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            written = writer.write_all(&line) => written?,
        }
        shared.lines_sent.fetch_add(1, Ordering::Relaxed);
    }
    Ok(true)
}
