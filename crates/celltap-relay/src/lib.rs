//! Capture relay: one producer-facing manager, one trace file, at most one
//! live observer.

mod listener;
mod manager;
mod settings;

pub use listener::{
    Backlog, BacklogFuture, BacklogSource, ConnectionListener, DEFAULT_OUTBOX_CAPACITY,
    ListenerState, ListenerStats,
};
pub use manager::{CaptureManager, RelayStats};
pub use settings::RelaySettings;
