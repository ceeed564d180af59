use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::bus::CaptureBus;
use crate::chunk::Origin;
use crate::classifier::{Cursor, StreamViews, ViewBatch, ViewKind};
use crate::config::AppConfig;
use crate::error::{CaptureError, Result};
use crate::export::Exporter;
use crate::reader::{
    ForwardSink, PortConnector, PortLost, PortReader, ReaderSettings, SerialConnector,
};
use crate::stats::{self, Statistics, StatisticsSnapshot};

const PORT_LOST_BACKLOG: usize = 16;

/// Capture lifecycle shared by both port readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// A port failed to open, or every reader was lost. Needs `stop` before `start`.
    Faulted,
}

struct Session {
    bus: Arc<CaptureBus>,
    readers: Vec<PortReader>,
    consumer: JoinHandle<()>,
    supervisor: JoinHandle<()>,
    monitor: Option<JoinHandle<anyhow::Result<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Owns the two port readers, the capture bus and everything fed from it.
pub struct Engine {
    config: AppConfig,
    connector: Arc<dyn PortConnector>,
    state: Arc<watch::Sender<CaptureState>>,
    events: broadcast::Sender<PortLost>,
    views: Arc<StreamViews>,
    stats: Arc<Statistics>,
    /// Held while views and statistics change together.
    record: Arc<Mutex<()>>,
    session: Option<Session>,
}

impl Engine {
    pub fn new(config: AppConfig) -> Self {
        Self::with_connector(config, Arc::new(SerialConnector))
    }

    pub fn with_connector(config: AppConfig, connector: Arc<dyn PortConnector>) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        let (events, _) = broadcast::channel(PORT_LOST_BACKLOG);
        let views = Arc::new(StreamViews::new(config.view_retention));
        Self {
            config,
            connector,
            state: Arc::new(state),
            events,
            views,
            stats: Arc::new(Statistics::new()),
            record: Arc::new(Mutex::new(())),
            session: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    /// Validates configuration, opens both ports and starts capturing.
    ///
    /// Each start begins a fresh record: new views and new statistics.
    pub async fn start(&mut self) -> Result<()> {
        let current = self.state();
        if current != CaptureState::Idle {
            return Err(CaptureError::InvalidState(current));
        }
        self.config.validate()?;
        self.state.send_replace(CaptureState::Starting);

        match self.launch().await {
            Ok(session) => {
                self.session = Some(session);
                self.state.send_if_modified(|state| {
                    if *state == CaptureState::Starting {
                        *state = CaptureState::Running;
                        true
                    } else {
                        false
                    }
                });
                tracing::info!(
                    session = %self.config.session_name,
                    port_tx = %self.config.port_tx,
                    port_rx = %self.config.port_rx,
                    baud = self.config.baud_rate,
                    forward = self.config.forward,
                    "capture running"
                );
                Ok(())
            }
            Err(err) => {
                let next = if err.is_port_failure() {
                    CaptureState::Faulted
                } else {
                    CaptureState::Idle
                };
                tracing::error!(session = %self.config.session_name, error = %err, state = ?next, "capture failed to start");
                self.state.send_replace(next);
                Err(err)
            }
        }
    }

    async fn launch(&mut self) -> Result<Session> {
        let cfg = &self.config;
        let exporter = match &cfg.export_path {
            Some(path) => Some(
                Exporter::create(path, cfg.export_format)
                    .await
                    .map_err(|err| CaptureError::config(format!("{err:#}")))?,
            ),
            None => None,
        };

        let bus = Arc::new(CaptureBus::new(cfg.backlog_capacity, cfg.backpressure_policy));
        let views = Arc::new(StreamViews::new(cfg.view_retention));
        let stats = Arc::new(Statistics::new());
        // subscribe before any reader can fail
        let lost_rx = self.events.subscribe();

        let readers = self.open_readers(&bus)?;

        self.views = views.clone();
        self.stats = stats.clone();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let consumer = tokio::spawn(consume(
            bus.clone(),
            views,
            stats.clone(),
            self.record.clone(),
            exporter,
        ));
        let supervisor = tokio::spawn(supervise(
            lost_rx,
            stats.clone(),
            self.state.clone(),
            readers.len(),
            shutdown_rx.clone(),
        ));
        let monitor = (cfg.stats_interval_seconds > 0).then(|| {
            tokio::spawn(stats::monitor_statistics(
                Arc::new(cfg.session_name.clone()),
                stats,
                shutdown_rx,
                Duration::from_secs(cfg.stats_interval_seconds),
                Duration::from_secs(cfg.idle_threshold_seconds),
            ))
        });

        Ok(Session {
            bus,
            readers,
            consumer,
            supervisor,
            monitor,
            shutdown,
        })
    }

    fn reader_settings(&self, origin: Origin) -> ReaderSettings {
        let port_name = match origin {
            Origin::Tx => self.config.port_tx.clone(),
            Origin::Rx => self.config.port_rx.clone(),
        };
        ReaderSettings {
            origin,
            port_name,
            buffer_size: self.config.read_buffer_size,
            poll_interval: self.config.poll_interval(),
            idle_timeout: self.config.idle_timeout(),
        }
    }

    fn open_readers(&self, bus: &Arc<CaptureBus>) -> Result<Vec<PortReader>> {
        let serial = self.config.serial_settings();
        let tx_settings = self.reader_settings(Origin::Tx);
        let rx_settings = self.reader_settings(Origin::Rx);

        if !self.config.forward {
            let tx = PortReader::start(
                self.connector.as_ref(),
                tx_settings,
                &serial,
                bus.clone(),
                self.events.clone(),
            )?;
            return match PortReader::start(
                self.connector.as_ref(),
                rx_settings,
                &serial,
                bus.clone(),
                self.events.clone(),
            ) {
                Ok(rx) => Ok(vec![tx, rx]),
                Err(err) => {
                    // releases the tx port
                    tx.request_stop();
                    Err(err)
                }
            };
        }

        // Both ports must be open before either direction can be forwarded.
        let tx_port = self.connector.open(&tx_settings.port_name, &serial)?;
        let rx_port = self.connector.open(&rx_settings.port_name, &serial)?;
        let (tx_read, tx_write) = tokio::io::split(tx_port);
        let (rx_read, rx_write) = tokio::io::split(rx_port);
        let to_rx: ForwardSink = Box::new(rx_write);
        let to_tx: ForwardSink = Box::new(tx_write);
        Ok(vec![
            PortReader::spawn(tx_settings, tx_read, Some(to_rx), bus.clone(), self.events.clone()),
            PortReader::spawn(rx_settings, rx_read, Some(to_tx), bus.clone(), self.events.clone()),
        ])
    }

    /// Stops reading, drains every chunk already on the bus, then releases the ports.
    ///
    /// Also the way out of `Faulted`.
    pub async fn stop(&mut self) -> Result<()> {
        let current = self.state();
        if current == CaptureState::Idle {
            return Ok(());
        }
        self.state.send_replace(CaptureState::Stopping);

        if let Some(session) = self.session.take() {
            for reader in &session.readers {
                reader.request_stop();
            }
            for reader in session.readers {
                let origin = reader.origin();
                let exit = reader.join().await;
                tracing::debug!(origin = %origin, exit = ?exit, "reader joined");
            }
            session.bus.close();
            if let Err(err) = session.consumer.await {
                tracing::error!(error = %err, "bus consumer failed");
            }
            self.stats.observe_overruns(session.bus.overruns());

            session.shutdown.send_replace(true);
            if let Err(err) = session.supervisor.await {
                tracing::error!(error = %err, "port supervisor failed");
            }
            if let Some(monitor) = session.monitor {
                match monitor.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(error = %err, "statistics monitor failed"),
                    Err(err) => tracing::error!(error = %err, "statistics monitor panicked"),
                }
            }
        }

        self.state.send_replace(CaptureState::Idle);
        tracing::info!(session = %self.config.session_name, "capture stopped");
        Ok(())
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        if let Some(session) = &self.session {
            self.stats.observe_overruns(session.bus.overruns());
        }
        self.stats.snapshot()
    }

    /// Shared handle to the current record, for display or export contexts.
    pub fn views(&self) -> Arc<StreamViews> {
        self.views.clone()
    }

    pub fn view_since(&self, kind: ViewKind, since: Cursor, limit: usize) -> ViewBatch {
        self.views.view(kind).read_since(since, limit)
    }

    pub fn port_lost_events(&self) -> broadcast::Receiver<PortLost> {
        self.events.subscribe()
    }

    /// Empties every view and restarts the statistics window. A chunk arriving
    /// meanwhile lands either before the clear or in both afterwards.
    pub fn clear_views(&self) {
        let _record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        self.views.clear();
        self.stats.reset();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            for reader in &session.readers {
                reader.request_stop();
            }
            session.bus.close();
            session.shutdown.send_replace(true);
        }
    }
}

/// Single consumer of the bus: classifies, counts and optionally exports.
async fn consume(
    bus: Arc<CaptureBus>,
    views: Arc<StreamViews>,
    stats: Arc<Statistics>,
    record: Arc<Mutex<()>>,
    mut exporter: Option<Exporter>,
) {
    while let Some(chunk) = bus.recv().await {
        {
            let _record = record.lock().unwrap_or_else(PoisonError::into_inner);
            views.append(&chunk);
            stats.observe(&chunk);
        }
        stats.observe_overruns(bus.overruns());
        let export_failed = match exporter.as_mut() {
            Some(sink) => match sink.append(&chunk).await {
                Ok(()) => false,
                Err(err) => {
                    tracing::error!(path = %sink.path().display(), error = %err, "export failed, disabling exporter");
                    true
                }
            },
            None => false,
        };
        if export_failed {
            exporter = None;
        }
    }
    if let Some(mut sink) = exporter {
        if let Err(err) = sink.flush().await {
            tracing::error!(path = %sink.path().display(), error = %err, "export flush failed");
        } else {
            tracing::info!(path = %sink.path().display(), records = sink.records(), "export closed");
        }
    }
}

/// Counts lost ports and faults the session once no reader is left.
async fn supervise(
    mut lost_rx: broadcast::Receiver<PortLost>,
    stats: Arc<Statistics>,
    state: Arc<watch::Sender<CaptureState>>,
    readers: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lost = 0usize;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = lost_rx.recv() => match event {
                Ok(event) => {
                    stats.record_port_lost();
                    lost += 1;
                    tracing::warn!(
                        origin = %event.origin,
                        port = %event.port,
                        healthy = readers.saturating_sub(lost),
                        "capture continues without lost port"
                    );
                    if lost >= readers {
                        state.send_if_modified(|current| {
                            if matches!(current, CaptureState::Starting | CaptureState::Running) {
                                *current = CaptureState::Faulted;
                                true
                            } else {
                                false
                            }
                        });
                        tracing::error!("every port reader has been lost");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "port lost events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
