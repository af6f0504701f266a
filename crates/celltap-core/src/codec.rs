//! Line-oriented wire format shared by the trace file and the observer stream.
//!
//! Every encoded record is exactly one `\n`-terminated line:
//!
//! - cell info: a JSON array of the legacy-info entries followed by a final
//!   `{"timestamp": <secs>}` element,
//! - packets: `<PROTO>,<DIR>,<BASE64>,<TIMESTAMP>` with `-` standing in for an
//!   empty protocol or payload.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::Value;

use crate::error::CodecError;
use crate::record::{CapturedRecord, CellInfoEntry, Direction, TelemetryRecord};

/// Placeholder for a field that has no content, so every packet line keeps
/// four fields.
pub const EMPTY_MARKER: &str = "-";

const TIMESTAMP_KEY: &str = "timestamp";

/// Converts captured records to and from their line representation.
///
/// Implementations must be pure: the same record always yields the same bytes.
pub trait RecordCodec: Send + Sync {
    /// Encode a record as a single newline-terminated line.
    fn encode(&self, captured: &CapturedRecord) -> String;

    /// Parse one line (with or without its terminator) back into a record.
    fn decode(&self, line: &str) -> Result<CapturedRecord, CodecError>;
}

/// The default codec: one line per record, with the capture timestamp as the
/// last field.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl RecordCodec for LineCodec {
    fn encode(&self, captured: &CapturedRecord) -> String {
        let micros = unix_micros(captured.captured_at);
        let mut line = match &captured.record {
            TelemetryRecord::CellInfo { legacy_info } => encode_cells(legacy_info, micros),
            TelemetryRecord::PacketCapture {
                payload,
                protocol,
                direction,
            } => encode_packet(payload, protocol, *direction, micros),
        };
        line.push('\n');
        line
    }

    fn decode(&self, line: &str) -> Result<CapturedRecord, CodecError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.starts_with('[') {
            decode_cells(line)
        } else {
            decode_packet(line)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Timestamps
// ─────────────────────────────────────────────────────────────────────────────

/// Microseconds since the UNIX epoch; instants before the epoch clamp to zero.
fn unix_micros(ts: SystemTime) -> u64 {
    ts.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64
}

fn from_micros(micros: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_micros(micros)
}

fn format_timestamp(micros: u64) -> String {
    format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000)
}

fn parse_timestamp(s: &str) -> Result<u64, CodecError> {
    let invalid = || CodecError::Timestamp(s.to_string());
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let secs: u64 = secs.parse().map_err(|_| invalid())?;
    let frac_micros = if frac.is_empty() {
        0
    } else {
        let digits: u64 = frac.parse().map_err(|_| invalid())?;
        digits * 10u64.pow(6 - frac.len() as u32)
    };
    secs.checked_mul(1_000_000)
        .and_then(|m| m.checked_add(frac_micros))
        .ok_or_else(invalid)
}

// ─────────────────────────────────────────────────────────────────────────────
// Cell info
// ─────────────────────────────────────────────────────────────────────────────

fn encode_cells(entries: &[CellInfoEntry], micros: u64) -> String {
    let mut items: Vec<Value> = entries.iter().cloned().map(Value::Object).collect();
    let mut stamp = CellInfoEntry::new();
    stamp.insert(TIMESTAMP_KEY.to_string(), Value::from(micros as f64 / 1e6));
    items.push(Value::Object(stamp));
    Value::Array(items).to_string()
}

fn decode_cells(line: &str) -> Result<CapturedRecord, CodecError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| CodecError::MalformedCells(e.to_string()))?;
    let Value::Array(mut items) = value else {
        return Err(CodecError::MalformedCells("expected a JSON array".into()));
    };

    let Some(Value::Object(stamp)) = items.pop() else {
        return Err(CodecError::MalformedCells(
            "missing trailing timestamp element".into(),
        ));
    };
    let secs = stamp
        .get(TIMESTAMP_KEY)
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| CodecError::Timestamp(Value::Object(stamp.clone()).to_string()))?;
    let micros = (secs * 1e6).round() as u64;

    let legacy_info = items
        .into_iter()
        .map(|item| match item {
            Value::Object(entry) => Ok(entry),
            other => Err(CodecError::MalformedCells(format!(
                "entry is not an object: {other}"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CapturedRecord::new(
        from_micros(micros),
        TelemetryRecord::CellInfo { legacy_info },
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Packets
// ─────────────────────────────────────────────────────────────────────────────

/// Replace characters that would break field or line framing.
fn sanitize_protocol(protocol: &str) -> String {
    if protocol.is_empty() {
        return EMPTY_MARKER.to_string();
    }
    protocol
        .chars()
        .map(|c| {
            if c == ',' || c.is_whitespace() || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

fn encode_packet(payload: &[u8], protocol: &str, direction: Direction, micros: u64) -> String {
    let payload = if payload.is_empty() {
        EMPTY_MARKER.to_string()
    } else {
        B64.encode(payload)
    };
    format!(
        "{},{},{},{}",
        sanitize_protocol(protocol),
        direction,
        payload,
        format_timestamp(micros)
    )
}

fn decode_packet(line: &str) -> Result<CapturedRecord, CodecError> {
    let fields: Vec<&str> = line.split(',').collect();
    let &[protocol, direction, payload, timestamp] = fields.as_slice() else {
        return Err(CodecError::MalformedPacket(format!(
            "expected 4 fields, got {}",
            fields.len()
        )));
    };

    let direction = Direction::parse(direction)
        .ok_or_else(|| CodecError::MalformedPacket(format!("unknown direction {direction:?}")))?;
    let protocol = if protocol == EMPTY_MARKER {
        String::new()
    } else {
        protocol.to_string()
    };
    let payload = if payload == EMPTY_MARKER {
        Vec::new()
    } else {
        B64.decode(payload)
            .map_err(|e| CodecError::MalformedPacket(format!("invalid base64 payload: {e}")))?
    };
    let micros = parse_timestamp(timestamp)?;

    Ok(CapturedRecord::new(
        from_micros(micros),
        TelemetryRecord::packet(payload, protocol, direction),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(micros: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(micros)
    }

    fn cell_entry(cell_id: i64, mcc: i64) -> CellInfoEntry {
        let Value::Object(map) = json!({ "CellId": cell_id, "MCC": mcc, "CellRadioAccessTechnology": "RadioAccessTechnologyLTE" }) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn test_packet_line_format() {
        let captured = CapturedRecord::new(
            at(1_700_000_000_123_456),
            TelemetryRecord::packet(vec![0x01, 0x02, 0x03], "QMI", Direction::Inbound),
        );
        assert_eq!(
            LineCodec.encode(&captured),
            "QMI,IN,AQID,1700000000.123456\n"
        );
    }

    #[test]
    fn test_packet_empty_fields_use_marker() {
        let captured = CapturedRecord::new(
            at(5),
            TelemetryRecord::packet(Vec::new(), "", Direction::Outbound),
        );
        let line = LineCodec.encode(&captured);
        assert_eq!(line, "-,OUT,-,0.000005\n");

        let back = LineCodec.decode(&line).unwrap();
        assert_eq!(back, captured);
    }

    #[test]
    fn test_packet_protocol_is_sanitized() {
        let captured = CapturedRecord::new(
            at(0),
            TelemetryRecord::packet(vec![0xde, 0xc0], "A,R\nI", Direction::Inbound),
        );
        let line = LineCodec.encode(&captured);
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(line.trim_end().split(',').count(), 4);
        assert!(line.starts_with("A_R_I,IN,"));
    }

    #[test]
    fn test_packet_decode() {
        let back = LineCodec.decode("ARI,OUT,3sB+qw==,1686000000.5").unwrap();
        assert_eq!(back.captured_at, at(1_686_000_000_500_000));
        assert_eq!(
            back.record,
            TelemetryRecord::packet(vec![0xde, 0xc0, 0x7e, 0xab], "ARI", Direction::Outbound)
        );
    }

    #[test]
    fn test_packet_decode_rejects_bad_lines() {
        assert!(matches!(
            LineCodec.decode("QMI,IN,AQID"),
            Err(CodecError::MalformedPacket(_))
        ));
        assert!(matches!(
            LineCodec.decode("QMI,SIDEWAYS,AQID,1.0"),
            Err(CodecError::MalformedPacket(_))
        ));
        assert!(matches!(
            LineCodec.decode("QMI,IN,AQID,yesterday"),
            Err(CodecError::Timestamp(_))
        ));
    }

    #[test]
    fn test_cell_line_format() {
        let captured = CapturedRecord::new(
            at(1_700_000_000_250_000),
            TelemetryRecord::cells(vec![cell_entry(4711, 262)]),
        );
        let line = LineCodec.encode(&captured);
        assert!(line.ends_with("\n"));

        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["CellId"], 4711);
        assert_eq!(items[1]["timestamp"], 1_700_000_000.25);
    }

    #[test]
    fn test_cell_empty_entries_keep_timestamp() {
        let captured = CapturedRecord::new(at(2_000_000), TelemetryRecord::cells(Vec::new()));
        let line = LineCodec.encode(&captured);
        assert_eq!(line, "[{\"timestamp\":2.0}]\n");
        assert_eq!(LineCodec.decode(&line).unwrap(), captured);
    }

    #[test]
    fn test_cell_decode_rejects_bad_lines() {
        assert!(LineCodec.decode("[]").is_err());
        assert!(LineCodec.decode("[1, {\"timestamp\": 1.0}]").is_err());
        assert!(LineCodec.decode("[{\"CellId\": 1}]").is_err());
        assert!(LineCodec.decode("[{\"timestamp\": 1.0}").is_err());
    }

    #[test]
    fn test_encode_is_stable_through_decode() {
        let records = [
            CapturedRecord::new(
                at(1_712_345_678_901_234),
                TelemetryRecord::cells(vec![cell_entry(1, 262), cell_entry(2, 310)]),
            ),
            CapturedRecord::new(
                at(1_712_345_678_000_001),
                TelemetryRecord::packet(vec![0u8; 64], "QMI", Direction::Outbound),
            ),
            CapturedRecord::new(
                at(1_712_345_678_999_999),
                TelemetryRecord::packet(b"\x7e\xab".to_vec(), "Some Proto", Direction::Inbound),
            ),
        ];

        for captured in &records {
            let first = LineCodec.encode(captured);
            let second = LineCodec.encode(&LineCodec.decode(&first).unwrap());
            assert_eq!(first, second);
            assert_eq!(first, LineCodec.encode(captured));
        }
    }

    #[test]
    fn test_timestamp_parsing() {
        assert_eq!(parse_timestamp("12").unwrap(), 12_000_000);
        assert_eq!(parse_timestamp("12.5").unwrap(), 12_500_000);
        assert_eq!(parse_timestamp("12.000007").unwrap(), 12_000_007);
        assert!(parse_timestamp("12.0000001").is_err());
        assert!(parse_timestamp("-1.0").is_err());
        assert!(parse_timestamp("1.-5").is_err());
    }
}
