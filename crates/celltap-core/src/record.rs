use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One opaque key/value dictionary from a cellular legacy-info snapshot.
pub type CellInfoEntry = serde_json::Map<String, serde_json::Value>;

/// Direction a baseband packet travelled when it was intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Baseband -> host.
    #[serde(rename = "IN")]
    Inbound,
    /// Host -> baseband.
    #[serde(rename = "OUT")]
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "IN",
            Self::Outbound => "OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN" => Some(Self::Inbound),
            "OUT" => Some(Self::Outbound),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// A single captured observation handed to the relay by host instrumentation.
///
/// Records are immutable once built; the relay clones them into its cache and
/// never mutates them afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    /// Snapshot of the modem's legacy cell info, one entry per visible cell.
    CellInfo { legacy_info: Vec<CellInfoEntry> },
    /// A raw baseband management packet (QMI, ARI, ...).
    PacketCapture {
        payload: Bytes,
        protocol: String,
        direction: Direction,
    },
}

impl TelemetryRecord {
    pub fn cells(legacy_info: Vec<CellInfoEntry>) -> Self {
        Self::CellInfo { legacy_info }
    }

    pub fn packet(
        payload: impl Into<Bytes>,
        protocol: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self::PacketCapture {
            payload: payload.into(),
            protocol: protocol.into(),
            direction,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::CellInfo { .. } => RecordKind::Cells,
            Self::PacketCapture { .. } => RecordKind::Packets,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Cells,
    Packets,
}

impl RecordKind {
    /// Port the observer app expects for this kind of relay.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Cells => 33066,
            Self::Packets => 33067,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cells => "cells",
            Self::Packets => "packets",
        })
    }
}

/// A record together with the instant the relay accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedRecord {
    pub captured_at: SystemTime,
    pub record: TelemetryRecord,
}

impl CapturedRecord {
    pub fn new(captured_at: SystemTime, record: TelemetryRecord) -> Self {
        Self {
            captured_at,
            record,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_parse() {
        assert_eq!(Direction::parse("IN"), Some(Direction::Inbound));
        assert_eq!(Direction::parse("OUT"), Some(Direction::Outbound));
        assert_eq!(Direction::parse("in"), None);
        assert_eq!(Direction::Outbound.to_string(), "OUT");
    }

    #[test]
    fn test_record_kind() {
        let cells = TelemetryRecord::cells(Vec::new());
        let packet = TelemetryRecord::packet(vec![1u8, 2, 3], "QMI", Direction::Inbound);
        assert_eq!(cells.kind(), RecordKind::Cells);
        assert_eq!(packet.kind(), RecordKind::Packets);
        assert_eq!(RecordKind::Cells.default_port(), 33066);
        assert_eq!(RecordKind::Packets.default_port(), 33067);
    }

    #[test]
    fn test_record_serde_tagged() {
        let mut entry = CellInfoEntry::new();
        entry.insert("CellId".into(), serde_json::json!(4711));
        let record = TelemetryRecord::cells(vec![entry]);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "cell_info");
        assert_eq!(json["legacy_info"][0]["CellId"], 4711);

        let back: TelemetryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_packet_direction_serde() {
        let record = TelemetryRecord::packet(vec![0x01], "QMI", Direction::Outbound);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "packet_capture");
        assert_eq!(json["direction"], "OUT");
    }
}
