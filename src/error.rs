use std::io;

use thiserror::Error;

use crate::engine::CaptureState;

/// Failures surfaced by the capture engine.
///
/// Overruns are counted on the bus and in [`crate::stats::StatisticsSnapshot`]
/// rather than raised. A port lost mid-capture is a
/// [`crate::reader::PortLost`] event, not an error.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("serial port {port} is unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("permission denied opening serial port {port}")]
    PermissionDenied { port: String },

    #[error("unsupported baud rate {0}")]
    InvalidBaudRate(u32),

    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("operation not allowed while capture is {0:?}")]
    InvalidState(CaptureState),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CaptureError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Maps a tokio-serial open failure onto the engine taxonomy.
    pub fn from_open(port: &str, err: tokio_serial::Error) -> Self {
        use tokio_serial::ErrorKind;
        match err.kind {
            ErrorKind::Io(io::ErrorKind::PermissionDenied) => Self::PermissionDenied {
                port: port.to_string(),
            },
            _ => Self::PortUnavailable {
                port: port.to_string(),
                reason: err.description,
            },
        }
    }

    /// Open failures that originate in the OS rather than in the configuration.
    pub fn is_port_failure(&self) -> bool {
        matches!(
            self,
            Self::PortUnavailable { .. } | Self::PermissionDenied { .. } | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
