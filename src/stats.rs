use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;

use crate::chunk::{Chunk, Origin};

struct Timing {
    started: Instant,
    started_at: DateTime<Utc>,
    last_update: Option<(Instant, DateTime<Utc>)>,
}

/// Running byte and packet counters for both directions.
///
/// Only the bus consumer calls [`Statistics::observe`]; snapshots may be
/// taken from any thread at any time.
pub struct Statistics {
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    packets_tx: AtomicU64,
    packets_rx: AtomicU64,
    overruns: AtomicU64,
    ports_lost: AtomicU64,
    timing: Mutex<Timing>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            bytes_tx: AtomicU64::new(0),
            bytes_rx: AtomicU64::new(0),
            packets_tx: AtomicU64::new(0),
            packets_rx: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            ports_lost: AtomicU64::new(0),
            timing: Mutex::new(Timing {
                started: Instant::now(),
                started_at: Utc::now(),
                last_update: None,
            }),
        }
    }

    pub fn observe(&self, chunk: &Chunk) {
        let len = chunk.len() as u64;
        match chunk.origin() {
            Origin::Tx => {
                self.bytes_tx.fetch_add(len, Ordering::Relaxed);
                self.packets_tx.fetch_add(1, Ordering::Relaxed);
            }
            Origin::Rx => {
                self.bytes_rx.fetch_add(len, Ordering::Relaxed);
                self.packets_rx.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        timing.last_update = Some((Instant::now(), Utc::now()));
    }

    /// Mirrors the bus's cumulative overrun count; never moves backwards.
    pub fn observe_overruns(&self, total: u64) {
        self.overruns.fetch_max(total, Ordering::Relaxed);
    }

    pub fn record_port_lost(&self) {
        self.ports_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Zeroes the traffic counters and restarts the rate window. The overrun
    /// count is kept because it mirrors the bus.
    pub fn reset(&self) {
        self.bytes_tx.store(0, Ordering::Relaxed);
        self.bytes_rx.store(0, Ordering::Relaxed);
        self.packets_tx.store(0, Ordering::Relaxed);
        self.packets_rx.store(0, Ordering::Relaxed);
        let mut timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
        *timing = Timing {
            started: Instant::now(),
            started_at: Utc::now(),
            last_update: None,
        };
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let (elapsed, start_time, last_update_time, idle_for) = {
            let timing = self.timing.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            (
                now.saturating_duration_since(timing.started),
                timing.started_at,
                timing.last_update.map(|(_, at)| at),
                timing
                    .last_update
                    .map(|(instant, _)| now.saturating_duration_since(instant)),
            )
        };
        StatisticsSnapshot {
            total_bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            total_bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            packet_count_tx: self.packets_tx.load(Ordering::Relaxed),
            packet_count_rx: self.packets_rx.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            ports_lost: self.ports_lost.load(Ordering::Relaxed),
            start_time,
            last_update_time,
            elapsed,
            idle_for,
        }
    }
}

/// Read-only copy of [`Statistics`]. Rates are cumulative averages since
/// `start_time`, not instantaneous readings.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub total_bytes_tx: u64,
    pub total_bytes_rx: u64,
    pub packet_count_tx: u64,
    pub packet_count_rx: u64,
    pub overruns: u64,
    pub ports_lost: u64,
    pub start_time: DateTime<Utc>,
    pub last_update_time: Option<DateTime<Utc>>,
    pub elapsed: Duration,
    /// Time since the last observed chunk.
    pub idle_for: Option<Duration>,
}

impl StatisticsSnapshot {
    /// Bytes for one direction, or both when `origin` is `None`.
    pub fn bytes(&self, origin: Option<Origin>) -> u64 {
        match origin {
            Some(Origin::Tx) => self.total_bytes_tx,
            Some(Origin::Rx) => self.total_bytes_rx,
            None => self.total_bytes_tx + self.total_bytes_rx,
        }
    }

    pub fn packets(&self, origin: Option<Origin>) -> u64 {
        match origin {
            Some(Origin::Tx) => self.packet_count_tx,
            Some(Origin::Rx) => self.packet_count_rx,
            None => self.packet_count_tx + self.packet_count_rx,
        }
    }

    pub fn bytes_per_second(&self, origin: Option<Origin>) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes(origin) as f64 / secs
    }

    /// Percentage of all captured bytes that travelled in `origin`'s direction.
    pub fn direction_share(&self, origin: Origin) -> f64 {
        match self.bytes(None) {
            0 => 0.0,
            total => self.bytes(Some(origin)) as f64 * 100.0 / total as f64,
        }
    }

    /// Zero when no packets were seen.
    pub fn average_packet_size(&self, origin: Option<Origin>) -> f64 {
        match self.packets(origin) {
            0 => 0.0,
            packets => self.bytes(origin) as f64 / packets as f64,
        }
    }
}

/// Periodically logs a statistics heartbeat and warns when the line goes quiet.
pub async fn monitor_statistics(
    session: Arc<String>,
    stats: Arc<Statistics>,
    mut shutdown: watch::Receiver<bool>,
    every: Duration,
    idle_threshold: Duration,
) -> Result<()> {
    let mut ticker = interval(every);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let snapshot = stats.snapshot();
                tracing::info!(
                    session = %session,
                    bytes_tx = snapshot.total_bytes_tx,
                    bytes_rx = snapshot.total_bytes_rx,
                    packets_tx = snapshot.packet_count_tx,
                    packets_rx = snapshot.packet_count_rx,
                    bytes_per_sec = snapshot.bytes_per_second(None),
                    overruns = snapshot.overruns,
                    "capture heartbeat"
                );
                if let Some(age) = snapshot.idle_for {
                    if age > idle_threshold {
                        tracing::warn!(
                            session = %session,
                            idle_seconds = ?age.as_secs_f64(),
                            "no traffic in the last {} seconds",
                            idle_threshold.as_secs()
                        );
                    }
                }
            }
        }
    }
    Ok(())
}
