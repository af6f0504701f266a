use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use celltap_core::codec::{LineCodec, RecordCodec};
use celltap_core::record::{CapturedRecord, CellInfoEntry, Direction, RecordKind, TelemetryRecord};
use celltap_relay::{CaptureManager, RelaySettings};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::warn;

// ─────────────────────────────────────────────────────────────────────────────
// CLI
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Kind {
    /// Cellular legacy-info snapshots.
    Cells,
    /// Baseband management packets (QMI / ARI).
    Packets,
}

impl From<Kind> for RecordKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Cells => RecordKind::Cells,
            Kind::Packets => RecordKind::Packets,
        }
    }
}

#[derive(Parser)]
#[command(name = "celltap", about = "Local telemetry capture relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read records as JSON Lines on stdin, persist them and stream them to
    /// one observer.
    Relay(RelayArgs),
    /// Connect to a relay and print every pushed record as a JSON object.
    Observe(ObserveArgs),
}

#[derive(Args)]
struct RelayArgs {
    /// Kind of records this relay carries.
    #[arg(short, long, value_enum, default_value = "cells")]
    kind: Kind,

    /// Port observers connect to (default: 33066 for cells, 33067 for packets).
    #[arg(short, long)]
    port: Option<u16>,

    /// Trace file name; relative names land in the data directory.
    #[arg(long, value_name = "FILE")]
    cache_file: Option<PathBuf>,

    /// Directory for the trace file.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Address to bind (default: 127.0.0.1).
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Lines buffered for a slow observer before the oldest are dropped.
    #[arg(long)]
    outbox_capacity: Option<usize>,

    /// Send each new observer the existing trace before live records.
    #[arg(long)]
    replay: bool,

    /// JSON file with relay settings; command line flags take precedence.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct ObserveArgs {
    /// Relay port to connect to.
    #[arg(short, long, default_value = "33066")]
    port: u16,

    /// Relay host.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,
}

fn default_data_dir(kind: RecordKind) -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("celltap")
        .join(kind.to_string())
}

fn load_settings(args: &RelayArgs, kind: RecordKind) -> anyhow::Result<RelaySettings> {
    let mut settings = match &args.config {
        Some(path) => read_settings(path)?,
        None => RelaySettings::default(),
    };
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }
    if let Some(capacity) = args.outbox_capacity {
        settings.outbox_capacity = capacity;
    }
    if args.replay {
        settings.replay_on_connect = true;
    }
    if let Some(dir) = &args.data_dir {
        settings.cache_dir = Some(dir.clone());
    } else if settings.cache_dir.is_none() {
        settings.cache_dir = Some(default_data_dir(kind));
    }
    Ok(settings)
}

fn read_settings(path: &Path) -> anyhow::Result<RelaySettings> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid settings in {}", path.display()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Host input (stdin) and observer output (stdout)
// ─────────────────────────────────────────────────────────────────────────────

/// One record as written by host instrumentation, one JSON object per line.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum HostInput {
    CellInfo {
        legacy_info: Vec<CellInfoEntry>,
    },
    PacketCapture {
        #[serde(default)]
        payload_b64: String,
        #[serde(default)]
        protocol: String,
        direction: Direction,
    },
}

fn parse_host_input(line: &str) -> anyhow::Result<TelemetryRecord> {
    let record = match serde_json::from_str::<HostInput>(line)? {
        HostInput::CellInfo { legacy_info } => TelemetryRecord::cells(legacy_info),
        HostInput::PacketCapture {
            payload_b64,
            protocol,
            direction,
        } => TelemetryRecord::packet(B64.decode(payload_b64)?, protocol, direction),
    };
    Ok(record)
}

/// Fully serializable view of a record received from a relay.
#[derive(Serialize)]
struct JsonlRecord {
    /// Unix timestamp of the capture in milliseconds.
    timestamp_ms: u64,
    /// "cells" or "packets".
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    legacy_info: Option<Vec<CellInfoEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    direction: Option<Direction>,
    /// Packet payload, base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
}

fn record_to_jsonl(captured: &CapturedRecord) -> JsonlRecord {
    let timestamp_ms = captured
        .captured_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut out = JsonlRecord {
        timestamp_ms,
        kind: captured.record.kind().to_string(),
        legacy_info: None,
        protocol: None,
        direction: None,
        payload_b64: None,
    };
    match &captured.record {
        TelemetryRecord::CellInfo { legacy_info } => {
            out.legacy_info = Some(legacy_info.clone());
        }
        TelemetryRecord::PacketCapture {
            payload,
            protocol,
            direction,
        } => {
            out.protocol = Some(protocol.clone());
            out.direction = Some(*direction);
            out.payload_b64 = Some(B64.encode(payload));
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is reserved for JSON Lines output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("celltap=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Relay(args) => run_relay(args).await,
        Command::Observe(args) => run_observe(args).await,
    }
}

/// Identity of the relay per record kind: writer thread name, log prefix and
/// tweak name.
fn identity(kind: RecordKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        RecordKind::Cells => ("celltap.cells.writer", "[CCT] ", "CaptureCellsTweak"),
        RecordKind::Packets => ("celltap.packets.writer", "[CPT] ", "CapturePacketsTweak"),
    }
}

async fn run_relay(args: RelayArgs) -> anyhow::Result<()> {
    let kind = RecordKind::from(args.kind);
    let settings = load_settings(&args, kind)?;
    let cache_file = args
        .cache_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{kind}.log")));
    let port = args.port.unwrap_or_else(|| kind.default_port());

    let (queue_name, log_prefix, tweak_name) = identity(kind);
    let manager =
        CaptureManager::new(queue_name, log_prefix, tweak_name, cache_file).with_settings(settings);
    let addr = manager.listen(port).await?;

    eprintln!("celltap: relaying {kind} on {addr}");
    eprintln!("  Observe with: celltap observe --port {}", addr.port());
    eprintln!("celltap: trace file {}", manager.cache_path().display());

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = input.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_host_input(&line) {
                    Ok(record) if record.kind() == kind => manager.add_data(record),
                    Ok(record) => warn!("skipping {} record on a {kind} relay", record.kind()),
                    Err(e) => warn!("skipping input line: {e}"),
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    let stats = manager.stats();
    manager.close().await;
    eprintln!(
        "celltap: {} records relayed, {} sent to observers, {} dropped",
        stats.records, stats.lines_sent, stats.lines_dropped
    );
    Ok(())
}

async fn run_observe(args: ObserveArgs) -> anyhow::Result<()> {
    let stream = TcpStream::connect((args.host, args.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    eprintln!("celltap: observing {}:{}", args.host, args.port);

    let mut lines = BufReader::new(stream).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match LineCodec.decode(&line) {
                    Ok(captured) => {
                        println!("{}", serde_json::to_string(&record_to_jsonl(&captured))?);
                    }
                    Err(e) => warn!("undecodable line from relay: {e}"),
                }
            }
            _ = &mut ctrl_c => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_cell_input() {
        let record = parse_host_input(
            r#"{"kind":"cell_info","legacy_info":[{"CellId":4711,"MCC":262}]}"#,
        )
        .unwrap();
        let TelemetryRecord::CellInfo { legacy_info } = record else {
            panic!("wrong variant");
        };
        assert_eq!(legacy_info.len(), 1);
        assert_eq!(legacy_info[0]["CellId"], 4711);
    }

    #[test]
    fn test_parse_packet_input() {
        let record = parse_host_input(
            r#"{"kind":"packet_capture","payload_b64":"AQID","protocol":"QMI","direction":"OUT"}"#,
        )
        .unwrap();
        assert_eq!(
            record,
            TelemetryRecord::packet(vec![1u8, 2, 3], "QMI", Direction::Outbound)
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_host_input("not json").is_err());
        assert!(
            parse_host_input(r#"{"kind":"packet_capture","payload_b64":"!!","direction":"IN"}"#)
                .is_err()
        );
    }

    #[test]
    fn test_jsonl_packet_view() {
        let captured = CapturedRecord::new(
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_123),
            TelemetryRecord::packet(vec![0xde, 0xc0, 0x7e, 0xab], "ARI", Direction::Inbound),
        );
        let json = serde_json::to_value(record_to_jsonl(&captured)).unwrap();
        assert_eq!(json["timestamp_ms"], 1_700_000_000_123u64);
        assert_eq!(json["kind"], "packets");
        assert_eq!(json["direction"], "IN");
        assert_eq!(json["payload_b64"], "3sB+qw==");
        assert!(json.get("legacy_info").is_none());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["celltap", "relay", "--kind", "packets"]).unwrap();
        let Command::Relay(args) = cli.command else {
            panic!("expected relay");
        };
        assert_eq!(args.kind, Kind::Packets);
        let settings = load_settings(&args, RecordKind::Packets).unwrap();
        assert!(settings.cache_dir.unwrap().ends_with("celltap/packets"));
        assert!(!settings.replay_on_connect);
    }

    #[test]
    fn test_config_file_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("relay.json");
        std::fs::write(&config, r#"{ "outbox_capacity": 32, "cache_dir": "/srv/celltap" }"#)
            .unwrap();

        let cli = Cli::try_parse_from([
            "celltap",
            "relay",
            "--kind",
            "cells",
            "--replay",
            "--config",
            config.to_str().unwrap(),
        ])
        .unwrap();
        let Command::Relay(args) = cli.command else {
            panic!("expected relay");
        };
        let settings = load_settings(&args, RecordKind::Cells).unwrap();
        assert_eq!(settings.outbox_capacity, 32);
        assert_eq!(settings.cache_dir, Some(PathBuf::from("/srv/celltap")));
        assert!(settings.replay_on_connect);
    }

    #[test]
    fn test_bad_config_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("relay.json");
        std::fs::write(&config, "{ not json").unwrap();

        let err = read_settings(&config).unwrap_err();
        assert!(err.to_string().starts_with("invalid settings in "));
        assert!(err.to_string().contains("relay.json"));

        let missing = read_settings(&dir.path().join("missing.json")).unwrap_err();
        assert!(missing.to_string().starts_with("failed to read "));
        assert!(missing.chain().count() >= 2);
    }
}
