use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// The listening socket could not be bound.
#[derive(Debug, Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open trace file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to start write worker: {0}")]
    Worker(#[source] io::Error),
    #[error("failed to write trace line: {0}")]
    Write(#[source] io::Error),
    #[error("failed to flush trace file: {0}")]
    Flush(#[source] io::Error),
    #[error("write sink is closed")]
    Closed,
}

/// Failures on the live observer stream. These only ever downgrade the
/// listener to "no active connection".
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("failed to send to observer {peer}: {source}")]
    Send { peer: SocketAddr, source: io::Error },
    #[error("failed to read from observer {peer}: {source}")]
    Read { peer: SocketAddr, source: io::Error },
    #[error("observer {peer} closed the connection")]
    Closed { peer: SocketAddr },
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed cell line: {0}")]
    MalformedCells(String),
    #[error("malformed packet line: {0}")]
    MalformedPacket(String),
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}
