use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use crate::bus::CaptureBus;
use crate::chunk::{Chunk, Origin};
use crate::config::{ParityMode, SerialSettings};
use crate::error::{CaptureError, Result};

/// Chunks a forwarder may hold before its direction is considered stalled.
const FORWARD_BACKLOG: usize = 64;

/// Anything a reader can pull bytes from (and forward bytes into).
pub trait PortIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PortIo for T {}

pub type ForwardSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens the connection behind a port name.
pub trait PortConnector: Send + Sync {
    fn open(&self, port_name: &str, settings: &SerialSettings) -> Result<Box<dyn PortIo>>;
}

/// Opens real (or virtual COM) ports through tokio-serial.
#[derive(Debug, Clone, Default)]
pub struct SerialConnector;

impl PortConnector for SerialConnector {
    fn open(&self, port_name: &str, settings: &SerialSettings) -> Result<Box<dyn PortIo>> {
        let data_bits = match settings.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let parity = match settings.parity {
            ParityMode::None => Parity::None,
            ParityMode::Odd => Parity::Odd,
            ParityMode::Even => Parity::Even,
        };
        let stop_bits = match settings.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let stream = tokio_serial::new(port_name, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|err| CaptureError::from_open(port_name, err))?;
        tracing::debug!(port = %port_name, baud = settings.baud_rate, "serial port opened");
        Ok(Box::new(stream))
    }
}

/// A reader stopped because its port failed mid-capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortLost {
    pub origin: Origin,
    pub port: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub origin: Origin,
    pub port_name: String,
    pub buffer_size: usize,
    /// Backoff after a transient read error.
    pub poll_interval: Duration,
    /// Quiet period after which the reader logs that the line is idle. Also
    /// bounds a single forwarded write.
    pub idle_timeout: Duration,
}

/// Why a reader task returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderExit {
    Stopped,
    Lost(PortLost),
    BusClosed,
}

/// Handle to one running port reader task.
pub struct PortReader {
    origin: Origin,
    port_name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<ReaderExit>,
    forwarder: Option<JoinHandle<()>>,
}

impl PortReader {
    /// Opens `settings.port_name` through `connector` and starts reading it.
    pub fn start(
        connector: &dyn PortConnector,
        settings: ReaderSettings,
        serial: &SerialSettings,
        bus: Arc<CaptureBus>,
        events: broadcast::Sender<PortLost>,
    ) -> Result<Self> {
        let port = connector.open(&settings.port_name, serial)?;
        Ok(Self::spawn(settings, port, None, bus, events))
    }

    /// Starts reading an already opened source. When `forward` is set, every
    /// captured chunk is also written to it from a separate task, so a peer
    /// that stops draining never holds up capture.
    pub fn spawn<R>(
        settings: ReaderSettings,
        source: R,
        forward: Option<ForwardSink>,
        bus: Arc<CaptureBus>,
        events: broadcast::Sender<PortLost>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let origin = settings.origin;
        let port_name = settings.port_name.clone();
        let (queue, forwarder) = match forward {
            Some(sink) => {
                let (queue_tx, queue_rx) = mpsc::channel(FORWARD_BACKLOG);
                let task = tokio::spawn(forward_loop(
                    origin,
                    sink,
                    queue_rx,
                    stop_rx.clone(),
                    settings.idle_timeout,
                ));
                (Some(queue_tx), Some(task))
            }
            None => (None, None),
        };
        let handle = tokio::spawn(read_loop(settings, source, queue, bus, events, stop_rx));
        Self {
            origin,
            port_name,
            stop_tx,
            handle,
            forwarder,
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the loop without waiting for it.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Waits for the loop (and its forwarder) to return; the port is released
    /// when they do.
    pub async fn join(self) -> ReaderExit {
        let exit = match self.handle.await {
            Ok(exit) => exit,
            Err(err) => {
                tracing::error!(origin = %self.origin, port = %self.port_name, error = %err, "reader task failed");
                ReaderExit::Stopped
            }
        };
        if let Some(forwarder) = self.forwarder {
            if let Err(err) = forwarder.await {
                tracing::error!(origin = %self.origin, port = %self.port_name, error = %err, "forwarder task failed");
            }
        }
        exit
    }

    pub async fn stop(self) -> ReaderExit {
        self.request_stop();
        self.join().await
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn read_loop<R>(
    settings: ReaderSettings,
    mut source: R,
    mut forward: Option<mpsc::Sender<Chunk>>,
    bus: Arc<CaptureBus>,
    events: broadcast::Sender<PortLost>,
    mut stop: watch::Receiver<bool>,
) -> ReaderExit
where
    R: AsyncRead + Send + Unpin,
{
    let ReaderSettings {
        origin,
        port_name,
        buffer_size,
        poll_interval,
        idle_timeout,
    } = settings;
    let mut buf = vec![0u8; buffer_size.max(1)];
    tracing::info!(origin = %origin, port = %port_name, "port reader started");

    let lost = |reason: String| {
        let event = PortLost {
            origin,
            port: port_name.clone(),
            reason,
            at: Utc::now(),
        };
        tracing::error!(origin = %origin, port = %port_name, reason = %event.reason, "port lost");
        // nobody listening is fine
        let _ = events.send(event.clone());
        ReaderExit::Lost(event)
    };

    loop {
        if *stop.borrow() {
            break;
        }
        let read = tokio::select! {
            changed = stop.changed() => {
                // handle dropped
                if changed.is_err() {
                    break;
                }
                continue;
            }
            read = timeout(idle_timeout, source.read(&mut buf)) => read,
        };
        match read {
            Err(_elapsed) => {
                tracing::trace!(origin = %origin, port = %port_name, "line idle");
            }
            Ok(Ok(0)) => return lost("port closed".to_string()),
            Ok(Ok(n)) => {
                let Some(chunk) = Chunk::new(origin, &buf[..n]) else {
                    continue;
                };
                if let Some(queue) = forward.as_ref() {
                    if let Err(err) = queue.try_send(chunk.clone()) {
                        let cause = match err {
                            TrySendError::Full(_) => "peer is not draining",
                            TrySendError::Closed(_) => "peer writer stopped",
                        };
                        tracing::warn!(
                            origin = %origin,
                            port = %port_name,
                            cause,
                            "disabling forwarding to {}",
                            origin.peer()
                        );
                        forward = None;
                    }
                }
                if bus.push(chunk).await.is_err() {
                    tracing::debug!(origin = %origin, port = %port_name, "bus closed, reader exiting");
                    return ReaderExit::BusClosed;
                }
            }
            Ok(Err(err)) if is_transient(&err) => {
                tracing::trace!(origin = %origin, port = %port_name, error = %err, "transient read error");
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep(poll_interval) => {}
                }
            }
            Ok(Err(err)) => return lost(err.to_string()),
        }
    }

    tracing::info!(origin = %origin, port = %port_name, "port reader stopped");
    ReaderExit::Stopped
}

/// Writes captured chunks into the peer port. Returns on stop, when the reader
/// goes away, or on the first failed or overdue write; the reader then stops
/// forwarding this direction.
async fn forward_loop(
    origin: Origin,
    mut sink: ForwardSink,
    mut queue: mpsc::Receiver<Chunk>,
    mut stop: watch::Receiver<bool>,
    write_timeout: Duration,
) {
    let peer = origin.peer();
    loop {
        if *stop.borrow() {
            break;
        }
        let chunk = tokio::select! {
            _ = stop.changed() => break,
            next = queue.recv() => match next {
                Some(chunk) => chunk,
                None => break,
            },
        };
        let write = async {
            sink.write_all(chunk.payload()).await?;
            sink.flush().await
        };
        let written: std::result::Result<io::Result<()>, _> = tokio::select! {
            _ = stop.changed() => break,
            written = timeout(write_timeout, write) => written,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(origin = %origin, peer = %peer, error = %err, "forwarding write failed");
                break;
            }
            Err(_elapsed) => {
                tracing::warn!(
                    origin = %origin,
                    peer = %peer,
                    timeout_ms = write_timeout.as_millis() as u64,
                    "peer stopped draining forwarded bytes"
                );
                break;
            }
        }
    }
    tracing::debug!(origin = %origin, peer = %peer, "forwarder stopped");
}
