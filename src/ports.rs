use serde::Serialize;
use std::io;
use tokio_serial::{SerialPortInfo, SerialPortType};

use crate::error::{CaptureError, Result};

/// One entry of the port list shown before a capture is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub port_name: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub description: String,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vendor_id, product_id, description) = match info.port_type {
            SerialPortType::UsbPort(ref usb) => (
                Some(usb.vid),
                Some(usb.pid),
                describe(usb.manufacturer.as_deref(), usb.product.as_deref(), "USB serial"),
            ),
            SerialPortType::PciPort => (None, None, "PCI serial".to_string()),
            SerialPortType::BluetoothPort => (None, None, "Bluetooth serial".to_string()),
            SerialPortType::Unknown => (None, None, "serial port".to_string()),
        };
        Self {
            port_name: info.port_name,
            vendor_id,
            product_id,
            description,
        }
    }
}

fn describe(manufacturer: Option<&str>, product: Option<&str>, fallback: &str) -> String {
    match (manufacturer, product) {
        (Some(m), Some(p)) => format!("{m} {p}"),
        (Some(only), None) | (None, Some(only)) => only.to_string(),
        (None, None) => fallback.to_string(),
    }
}

/// Ports the OS currently reports. The capture engine never calls this.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports()
        .map_err(|err| CaptureError::Io(io::Error::other(err.description)))?;
    Ok(ports.into_iter().map(PortInfo::from).collect())
}

impl PortInfo {
    /// `VVVV:PPPP` for USB ports.
    pub fn usb_id(&self) -> Option<String> {
        Some(format!("{:04X}:{:04X}", self.vendor_id?, self.product_id?))
    }
}
