use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::listener::DEFAULT_OUTBOX_CAPACITY;

/// Tunables for a [`CaptureManager`](crate::CaptureManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Address observers connect to. Loopback unless explicitly widened.
    pub bind_addr: IpAddr,
    /// Lines buffered for a slow observer before the oldest are dropped.
    pub outbox_capacity: usize,
    /// Directory that relative cache file names are resolved against.
    pub cache_dir: Option<PathBuf>,
    /// Send each new observer the trace file's current contents before any
    /// live line.
    pub replay_on_connect: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            cache_dir: None,
            replay_on_connect: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: RelaySettings =
            serde_json::from_str(r#"{ "outbox_capacity": 16 }"#).unwrap();
        assert_eq!(settings.outbox_capacity, 16);
        assert_eq!(settings.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(settings.cache_dir, None);
        assert!(!settings.replay_on_connect);
    }

    #[test]
    fn test_full_json() {
        let settings: RelaySettings = serde_json::from_str(
            r#"{ "bind_addr": "0.0.0.0", "outbox_capacity": 8, "cache_dir": "/var/mobile/celltap", "replay_on_connect": true }"#,
        )
        .unwrap();
        assert_eq!(settings.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(settings.cache_dir, Some(PathBuf::from("/var/mobile/celltap")));
        assert!(settings.replay_on_connect);
    }
}
