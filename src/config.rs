use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::error::CaptureError;
use crate::hexdump::DEFAULT_BYTES_PER_ROW;

pub const SUPPORTED_BAUD_RATES: &[u32] = &[
    300, 600, 1200, 2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

/// Upper bound on how long a reader may take to notice a stop request.
pub const MAX_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Producers wait for the consumer when the backlog is full.
    Block,
    /// The oldest queued chunk is discarded and counted as an overrun.
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParityMode {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    JsonLines,
    Text,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_directory: Option<String>,
    pub port_tx: String,
    pub port_rx: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: ParityMode,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_bytes_per_row")]
    pub bytes_per_row: usize,
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
    #[serde(default = "default_backpressure_policy")]
    pub backpressure_policy: BackpressurePolicy,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Maximum chunks kept per view; 0 keeps everything.
    #[serde(default)]
    pub view_retention: usize,
    #[serde(default)]
    pub forward: bool,
    #[serde(default)]
    pub export_path: Option<String>,
    #[serde(default = "default_export_format")]
    pub export_format: ExportFormat,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_seconds: u64,
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_seconds: u64,
}

fn default_session_name() -> String {
    "comtap".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> ParityMode {
    ParityMode::None
}

fn default_stop_bits() -> u8 {
    1
}

fn default_bytes_per_row() -> usize {
    DEFAULT_BYTES_PER_ROW
}

fn default_backlog_capacity() -> usize {
    4096
}

fn default_backpressure_policy() -> BackpressurePolicy {
    BackpressurePolicy::DropOldest
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_poll_interval_ms() -> u64 {
    25
}

fn default_idle_timeout_ms() -> u64 {
    1000
}

fn default_export_format() -> ExportFormat {
    ExportFormat::JsonLines
}

fn default_stats_interval_secs() -> u64 {
    5
}

fn default_idle_threshold_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn default_path() -> &'static str {
        "config/comtap.toml"
    }

    /// A configuration with every default applied for the given port pair.
    pub fn for_ports(port_tx: impl Into<String>, port_rx: impl Into<String>) -> Self {
        Self {
            session_name: default_session_name(),
            log_level: default_log_level(),
            log_directory: None,
            port_tx: port_tx.into(),
            port_rx: port_rx.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            bytes_per_row: default_bytes_per_row(),
            backlog_capacity: default_backlog_capacity(),
            backpressure_policy: default_backpressure_policy(),
            read_buffer_size: default_read_buffer_size(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            view_retention: 0,
            forward: false,
            export_path: None,
            export_format: default_export_format(),
            stats_interval_seconds: default_stats_interval_secs(),
            idle_threshold_seconds: default_idle_threshold_secs(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("failed to read configuration from {}", path_ref.display()))?;
        let mut config: Self = toml::from_str(&raw).with_context(|| {
            format!("failed to parse configuration from {}", path_ref.display())
        })?;
        if config.session_name.trim().is_empty() {
            config.session_name = default_session_name();
        }
        Ok(config)
    }

    /// Checks every option the engine relies on before a session may start.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(CaptureError::InvalidBaudRate(self.baud_rate));
        }
        if self.port_tx.trim().is_empty() || self.port_rx.trim().is_empty() {
            return Err(CaptureError::config("port_tx and port_rx must both be set"));
        }
        if self.port_tx == self.port_rx {
            return Err(CaptureError::config(format!(
                "port_tx and port_rx both name {}",
                self.port_tx
            )));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(CaptureError::config(format!(
                "data_bits must be between 5 and 8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(CaptureError::config(format!(
                "stop_bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.bytes_per_row == 0 {
            return Err(CaptureError::config("bytes_per_row must be positive"));
        }
        if self.backlog_capacity == 0 {
            return Err(CaptureError::config("backlog_capacity must be positive"));
        }
        if self.read_buffer_size == 0 {
            return Err(CaptureError::config("read_buffer_size must be positive"));
        }
        if self.poll_interval_ms == 0 || self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(CaptureError::config(format!(
                "poll_interval_ms must be between 1 and {MAX_POLL_INTERVAL_MS}, got {}",
                self.poll_interval_ms
            )));
        }
        if self.idle_timeout_ms == 0 {
            return Err(CaptureError::config("idle_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            parity: self.parity,
            stop_bits: self.stop_bits,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Line settings handed to a [`crate::reader::PortConnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: ParityMode,
    pub stop_bits: u8,
}
