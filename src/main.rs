use anyhow::{bail, Context, Result};
use comtap::{
    classifier::{Cursor, StreamViews, ViewKind},
    export, hexdump, logging, ports, AppConfig, Engine, Origin,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, sync::watch, time::interval};

const DISPLAY_INTERVAL: Duration = Duration::from_millis(100);
const DISPLAY_BATCH: usize = 256;

#[derive(Debug)]
struct Cli {
    config_path: String,
    list_ports: bool,
    check: bool,
    save_log: Option<String>,
}

impl Cli {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut config_path: Option<String> = None;
        let mut list_ports = false;
        let mut check = false;
        let mut save_log: Option<String> = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                    config_path = Some(value);
                }
                "--save-log" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--save-log requires a path"))?;
                    save_log = Some(value);
                }
                "--list-ports" => list_ports = true,
                "--check" => check = true,
                "--help" | "-h" => {
                    println!(
                        "Usage: comtap [--config <path>] [--list-ports] [--check] [--save-log <path>]\n\
                         --config <path>     Path to TOML configuration (default: config/comtap.toml)\n\
                         --list-ports        List serial ports with USB vendor/product ids and exit\n\
                         --check             Validate the configuration and exit\n\
                         --save-log <path>   Write a full session log when capture stops"
                    );
                    std::process::exit(0);
                }
                other => {
                    if config_path.is_none() {
                        config_path = Some(other.to_string());
                    } else {
                        bail!("unknown argument '{other}'");
                    }
                }
            }
        }

        Ok(Self {
            config_path: config_path.unwrap_or_else(|| AppConfig::default_path().into()),
            list_ports,
            check,
            save_log,
        })
    }
}

fn print_ports() -> Result<()> {
    let found = ports::list_ports().context("failed to enumerate serial ports")?;
    if found.is_empty() {
        println!("no serial ports found");
    }
    for port in found {
        println!(
            "{:<24} {:<10} {}",
            port.port_name,
            port.usb_id().unwrap_or_else(|| "-".to_string()),
            port.description
        );
    }
    Ok(())
}

/// Prints combined-view chunks as they arrive; drains once more on shutdown.
async fn display_combined(
    views: Arc<StreamViews>,
    bytes_per_row: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cursor = Cursor::START;
    let mut ticker = interval(DISPLAY_INTERVAL);
    loop {
        let done = tokio::select! {
            _ = shutdown.changed() => true,
            _ = ticker.tick() => false,
        };
        loop {
            let batch = views.view(ViewKind::Combined).read_since(cursor, DISPLAY_BATCH);
            if batch.skipped > 0 {
                println!("... {} chunks dropped from view history ...", batch.skipped);
            }
            for chunk in &batch.chunks {
                let direction = match chunk.origin() {
                    Origin::Tx => "TX (app -> device)",
                    Origin::Rx => "RX (device -> app)",
                };
                println!(
                    "[{}] {} {} bytes",
                    chunk.captured_at().format("%H:%M:%S%.3f"),
                    direction,
                    chunk.len()
                );
                for row in hexdump::format_rows(chunk.payload(), bytes_per_row) {
                    println!("    {row}");
                }
            }
            let exhausted = batch.chunks.len() < DISPLAY_BATCH;
            cursor = batch.next;
            if exhausted {
                break;
            }
        }
        if done {
            break;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse()?;

    if cli.list_ports {
        return print_ports();
    }

    let config = AppConfig::load(&cli.config_path)
        .with_context(|| format!("unable to load configuration from {}", cli.config_path))?;

    if cli.check {
        config.validate().context("configuration rejected")?;
        println!(
            "configuration ok: {} <-> {} at {} baud",
            config.port_tx, config.port_rx, config.baud_rate
        );
        return Ok(());
    }

    let _log_guard = logging::init(&config)?;

    let bytes_per_row = config.bytes_per_row;
    let mut engine = Engine::new(config);
    engine.start().await.context("failed to start capture")?;

    let (display_tx, display_rx) = watch::channel(false);
    let display = tokio::spawn(display_combined(engine.views(), bytes_per_row, display_rx));

    let mut lost_events = engine.port_lost_events();
    let alerts = tokio::spawn(async move {
        while let Ok(event) = lost_events.recv().await {
            eprintln!(
                "!! {} port {} lost at {}: {}",
                event.origin,
                event.port,
                event.at.format("%H:%M:%S%.3f"),
                event.reason
            );
        }
    });

    signal::ctrl_c().await.ok();
    tracing::info!("ctrl-c received, stopping capture");
    engine.stop().await.context("failed to stop capture")?;

    display_tx.send(true).ok();
    display.await.context("display task failed")?;
    alerts.abort();

    let snapshot = engine.statistics();
    println!(
        "TX {} bytes / {} packets, RX {} bytes / {} packets, {:.1} B/s average, {} overruns, {} ports lost",
        snapshot.total_bytes_tx,
        snapshot.packet_count_tx,
        snapshot.total_bytes_rx,
        snapshot.packet_count_rx,
        snapshot.bytes_per_second(None),
        snapshot.overruns,
        snapshot.ports_lost
    );

    if let Some(path) = cli.save_log {
        export::write_session_log(&path, &engine.views(), &snapshot, bytes_per_row).await?;
        println!("session log written to {path}");
    }

    Ok(())
}
