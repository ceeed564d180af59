use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Direction a chunk travelled on the monitored line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Bytes sent by the monitored application towards the device.
    Tx,
    /// Bytes coming back from the device.
    Rx,
}

impl Origin {
    pub fn label(self) -> &'static str {
        match self {
            Origin::Tx => "TX",
            Origin::Rx => "RX",
        }
    }

    pub fn arrow(self) -> &'static str {
        match self {
            Origin::Tx => "->",
            Origin::Rx => "<-",
        }
    }

    pub fn peer(self) -> Origin {
        match self {
            Origin::Tx => Origin::Rx,
            Origin::Rx => Origin::Tx,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Bytes returned by one completed read, stamped when the read finished.
///
/// Cloning shares the payload, so every view can hold the same chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    origin: Origin,
    timestamp: Instant,
    captured_at: DateTime<Utc>,
    payload: Arc<[u8]>,
}

impl Chunk {
    /// Stamps `bytes` with the current instant. Returns `None` for an empty read.
    pub fn new(origin: Origin, bytes: &[u8]) -> Option<Self> {
        Self::with_timestamp(origin, Instant::now(), Utc::now(), bytes)
    }

    pub fn with_timestamp(
        origin: Origin,
        timestamp: Instant,
        captured_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        Some(Self {
            origin,
            timestamp,
            captured_at,
            payload: Arc::from(bytes),
        })
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Monotonic read-completion time; the authoritative ordering key.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Wall-clock time of the same read, used for display and export.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
