use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::AsyncWriteExt,
};

use crate::chunk::{Chunk, Origin};
use crate::classifier::{StreamViews, ViewKind};
use crate::config::ExportFormat;
use crate::hexdump::{ascii_gloss, format_rows, hex_string};
use crate::stats::StatisticsSnapshot;

const RULE_WIDTH: usize = 60;

/// Stable per-chunk record handed to log and file sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub origin: Origin,
    /// ISO-8601, UTC, millisecond precision.
    pub timestamp: String,
    pub byte_length: usize,
    pub hex: String,
    pub ascii: String,
}

impl ExportRecord {
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            origin: chunk.origin(),
            timestamp: chunk
                .captured_at()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            byte_length: chunk.len(),
            hex: hex_string(chunk.payload()),
            ascii: ascii_gloss(chunk.payload()),
        }
    }

    pub fn to_json_line(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize export record")
    }

    /// Multi-line block: header, `HEX:` and `ASC:` lines, then a rule.
    pub fn to_text_block(&self, chunk: &Chunk) -> String {
        format!(
            "[{}] {} {} ({} bytes)\nHEX: {}\nASC: {}\n{}\n",
            chunk.captured_at().format("%H:%M:%S%.3f"),
            self.origin,
            self.origin.arrow(),
            self.byte_length,
            self.hex,
            self.ascii,
            "-".repeat(RULE_WIDTH)
        )
    }
}

/// Appends one record per combined-view chunk to a flat file.
pub struct Exporter {
    path: PathBuf,
    format: ExportFormat,
    file: File,
    records: u64,
}

impl Exporter {
    pub async fn create(path: impl AsRef<Path>, format: ExportFormat) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create export directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            format,
            file,
            records: 0,
        })
    }

    pub async fn append(&mut self, chunk: &Chunk) -> Result<()> {
        let record = ExportRecord::from_chunk(chunk);
        let line = match self.format {
            ExportFormat::JsonLines => {
                let mut line = record.to_json_line()?;
                line.push('\n');
                line
            }
            ExportFormat::Text => record.to_text_block(chunk),
        };
        self.file
            .write_all(line.as_bytes())
            .await
            .context("failed to write export record")?;
        self.records += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await.context("failed to flush export file")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }
}

/// Renders a complete session: Tx, Rx and Combined sections plus statistics.
pub fn render_session_log(
    views: &StreamViews,
    snapshot: &StatisticsSnapshot,
    bytes_per_row: usize,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Serial capture log ===");
    let _ = writeln!(
        out,
        "Generated: {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    );

    for (kind, title) in [
        (ViewKind::Tx, "TX (application -> device)"),
        (ViewKind::Rx, "RX (device -> application)"),
        (ViewKind::Combined, "COMBINED"),
    ] {
        let _ = writeln!(out, "\n{title}:");
        let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
        for chunk in views.view(kind).snapshot() {
            let _ = writeln!(
                out,
                "[{}] {} {} ({} bytes)",
                chunk.captured_at().format("%H:%M:%S%.3f"),
                chunk.origin(),
                chunk.origin().arrow(),
                chunk.len()
            );
            for row in format_rows(chunk.payload(), bytes_per_row) {
                let _ = writeln!(out, "  {row}");
            }
        }
    }

    let _ = writeln!(out, "\nSTATISTICS:");
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(
        out,
        "TX: {} bytes in {} packets (avg {:.1} bytes)",
        snapshot.total_bytes_tx,
        snapshot.packet_count_tx,
        snapshot.average_packet_size(Some(Origin::Tx))
    );
    let _ = writeln!(
        out,
        "RX: {} bytes in {} packets (avg {:.1} bytes)",
        snapshot.total_bytes_rx,
        snapshot.packet_count_rx,
        snapshot.average_packet_size(Some(Origin::Rx))
    );
    let _ = writeln!(
        out,
        "Direction split: TX {:.1}% / RX {:.1}%",
        snapshot.direction_share(Origin::Tx),
        snapshot.direction_share(Origin::Rx)
    );
    let _ = writeln!(
        out,
        "Elapsed: {:.1}s, throughput {:.1} B/s (cumulative), overruns {}",
        snapshot.elapsed.as_secs_f64(),
        snapshot.bytes_per_second(None),
        snapshot.overruns
    );
    out
}

pub async fn write_session_log(
    path: impl AsRef<Path>,
    views: &StreamViews,
    snapshot: &StatisticsSnapshot,
    bytes_per_row: usize,
) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::write(path, render_session_log(views, snapshot, bytes_per_row))
        .await
        .with_context(|| format!("failed to write session log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Statistics;
    use chrono::TimeZone;
    use std::time::Instant;
    use tempfile::tempdir;

    fn chunk(origin: Origin, bytes: &[u8]) -> Chunk {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 15).unwrap()
            + chrono::Duration::milliseconds(42);
        Chunk::with_timestamp(origin, Instant::now(), at, bytes).expect("non-empty")
    }

    #[test]
    fn record_shape_is_stable() {
        let record = ExportRecord::from_chunk(&chunk(Origin::Tx, b"AT\r\n"));
        assert_eq!(record.timestamp, "2026-10-19T08:30:15.042Z");
        assert_eq!(record.byte_length, 4);
        assert_eq!(record.hex, "41 54 0D 0A");
        assert_eq!(record.ascii, "AT..");
        let json = record.to_json_line().expect("json");
        assert_eq!(
            json,
            r#"{"origin":"tx","timestamp":"2026-10-19T08:30:15.042Z","byte_length":4,"hex":"41 54 0D 0A","ascii":"AT.."}"#
        );
    }

    #[test]
    fn text_block_matches_log_layout() {
        let c = chunk(Origin::Rx, b"OK");
        let block = ExportRecord::from_chunk(&c).to_text_block(&c);
        let mut lines = block.lines();
        assert_eq!(lines.next(), Some("[08:30:15.042] RX <- (2 bytes)"));
        assert_eq!(lines.next(), Some("HEX: 4F 4B"));
        assert_eq!(lines.next(), Some("ASC: OK"));
        assert_eq!(lines.next(), Some("-".repeat(60).as_str()));
    }

    #[tokio::test]
    async fn exporter_appends_json_lines() {
        let tmp = tempdir().expect("temp dir");
        let path = tmp.path().join("nested").join("capture.jsonl");
        let mut exporter = Exporter::create(&path, ExportFormat::JsonLines)
            .await
            .expect("exporter");
        exporter.append(&chunk(Origin::Tx, b"ping")).await.expect("append");
        exporter.append(&chunk(Origin::Rx, b"pong")).await.expect("append");
        exporter.flush().await.expect("flush");
        assert_eq!(exporter.records(), 2);

        let content = tokio::fs::read_to_string(&path).await.expect("read export");
        let records: Vec<ExportRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).expect("record"))
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].origin, Origin::Tx);
        assert_eq!(records[1].ascii, "pong");
    }

    #[tokio::test]
    async fn session_log_has_every_section() {
        let views = StreamViews::new(0);
        let stats = Statistics::new();
        for c in [chunk(Origin::Tx, b"AT\r"), chunk(Origin::Rx, b"OK\r\n")] {
            views.append(&c);
            stats.observe(&c);
        }
        let tmp = tempdir().expect("temp dir");
        let path = tmp.path().join("session.txt");
        write_session_log(&path, &views, &stats.snapshot(), 16)
            .await
            .expect("write log");

        let content = std::fs::read_to_string(&path).expect("read log");
        assert!(content.contains("TX (application -> device):"));
        assert!(content.contains("RX (device -> application):"));
        assert!(content.contains("COMBINED:"));
        assert!(content.contains("00000000  41 54 0D"));
        assert!(content.contains("TX: 3 bytes in 1 packets"));
        assert!(content.contains("RX: 4 bytes in 1 packets"));
        assert!(content.contains("Direction split: TX 42.9% / RX 57.1%"));
    }
}
