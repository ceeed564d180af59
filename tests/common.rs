#![allow(dead_code)]

use assert_cmd::Command;
use comtap::config::SerialSettings;
use comtap::reader::{PortConnector, PortIo};
use comtap::{AppConfig, CaptureError};
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{duplex, DuplexStream};

pub const TX_PORT: &str = "virtual-tx";
pub const RX_PORT: &str = "virtual-rx";

/// In-memory stand-in for a pair of serial ports. The test keeps the
/// "device" end of each pipe and writes into it.
pub struct VirtualPorts {
    ports: Mutex<HashMap<String, DuplexStream>>,
}

impl VirtualPorts {
    pub fn pair() -> (Arc<Self>, DuplexStream, DuplexStream) {
        let (tx_device, tx_port) = duplex(4096);
        let (rx_device, rx_port) = duplex(4096);
        let mut ports = HashMap::new();
        ports.insert(TX_PORT.to_string(), tx_port);
        ports.insert(RX_PORT.to_string(), rx_port);
        (
            Arc::new(Self {
                ports: Mutex::new(ports),
            }),
            tx_device,
            rx_device,
        )
    }
}

impl PortConnector for VirtualPorts {
    fn open(
        &self,
        port_name: &str,
        _settings: &SerialSettings,
    ) -> Result<Box<dyn PortIo>, CaptureError> {
        let port = self
            .ports
            .lock()
            .expect("port table")
            .remove(port_name)
            .ok_or_else(|| CaptureError::PortUnavailable {
                port: port_name.to_string(),
                reason: "already claimed".to_string(),
            })?;
        Ok(Box::new(port))
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::for_ports(TX_PORT, RX_PORT);
    config.session_name = "integration".to_string();
    config.stats_interval_seconds = 0;
    config.idle_timeout_ms = 20;
    config
}

/// Writes `body` as a config file and runs the binary with `--check`.
pub fn check_config(body: &str) -> (TempDir, assert_cmd::assert::Assert) {
    let tmp = tempfile::tempdir().expect("create tempdir");
    let cfg_path = tmp.path().join("comtap.toml");
    fs::write(&cfg_path, body).expect("write config");
    let assert = Command::new(assert_cmd::cargo::cargo_bin!("comtap"))
        .arg("--config")
        .arg(&cfg_path)
        .arg("--check")
        .assert();
    (tmp, assert)
}
