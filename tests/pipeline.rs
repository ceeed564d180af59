mod common;

use chrono::Utc;
use comtap::bus::CaptureBus;
use comtap::classifier::{Cursor, StreamViews, ViewKind};
use comtap::config::{BackpressurePolicy, ExportFormat};
use comtap::export::ExportRecord;
use comtap::{CaptureState, Chunk, Engine, Origin};
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;

/// Small deterministic generator so interleavings vary per seed.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn drain_into(bus: &CaptureBus, views: &StreamViews) {
    while let Some(chunk) = bus.try_recv() {
        views.append(&chunk);
    }
}

fn payloads(views: &StreamViews, kind: ViewKind) -> Vec<Vec<u8>> {
    views
        .view(kind)
        .snapshot()
        .iter()
        .map(|c| c.payload().to_vec())
        .collect()
}

#[tokio::test]
async fn combined_view_is_ordered_and_lossless_for_any_interleaving() {
    for seed in 1..=25u64 {
        let mut rng = Lcg(seed);
        let bus = CaptureBus::new(1024, BackpressurePolicy::Block);
        let views = StreamViews::new(0);
        let base = Instant::now();

        // Per-source timestamps increase; the two sources race each other.
        let mut clock = [0u64; 2];
        let mut pushed = Vec::new();
        for i in 0..60u32 {
            let source = (rng.next() % 2) as usize;
            clock[source] += rng.next() % 3;
            let origin = if source == 0 { Origin::Tx } else { Origin::Rx };
            let bytes = i.to_be_bytes();
            let chunk = Chunk::with_timestamp(
                origin,
                base + Duration::from_millis(clock[source]),
                Utc::now(),
                &bytes[..1 + (rng.next() % 4) as usize],
            )
            .expect("non-empty");
            pushed.push(chunk.clone());
            bus.push(chunk).await.expect("push");
        }
        drain_into(&bus, &views);

        let combined = views.view(ViewKind::Combined).snapshot();
        assert_eq!(combined.len(), pushed.len(), "seed {seed}");
        for pair in combined.windows(2) {
            assert!(pair[0].timestamp() <= pair[1].timestamp(), "seed {seed}");
        }

        // stable: equal timestamps keep push order
        let mut expected = pushed.clone();
        expected.sort_by_key(|c| c.timestamp());
        assert_eq!(combined, expected, "seed {seed}");

        for origin in [Origin::Tx, Origin::Rx] {
            let filtered: Vec<Vec<u8>> = combined
                .iter()
                .filter(|c| c.origin() == origin)
                .map(|c| c.payload().to_vec())
                .collect();
            assert_eq!(filtered, payloads(&views, origin.into()), "seed {seed}");
        }
    }
}

#[tokio::test]
async fn readers_feed_combined_views_that_match_each_direction() {
    for seed in 1..=8u64 {
        let mut rng = Lcg(seed);
        let (ports, mut tx_device, mut rx_device) = common::VirtualPorts::pair();
        let mut config = common::test_config();
        config.backpressure_policy = BackpressurePolicy::Block;
        let mut engine = Engine::with_connector(config, ports);
        engine.start().await.expect("start");

        let mut sent = [Vec::new(), Vec::new()];
        for i in 0..24u8 {
            let source = (rng.next() % 2) as usize;
            let frame = vec![i; 1 + (rng.next() % 6) as usize];
            let device = if source == 0 {
                &mut tx_device
            } else {
                &mut rx_device
            };
            device.write_all(&frame).await.expect("write");
            sent[source].extend_from_slice(&frame);
            if rng.next() % 3 == 0 {
                sleep(Duration::from_millis(2)).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
        sleep(Duration::from_millis(40)).await;
        engine.stop().await.expect("stop");

        let views = engine.views();
        let combined = views.view(ViewKind::Combined).snapshot();
        let view_total: usize = combined.iter().map(Chunk::len).sum();
        assert_eq!(view_total, sent[0].len() + sent[1].len(), "seed {seed}");

        for (origin, expected) in [(Origin::Tx, &sent[0]), (Origin::Rx, &sent[1])] {
            let filtered: Vec<Chunk> = combined
                .iter()
                .filter(|c| c.origin() == origin)
                .cloned()
                .collect();
            assert_eq!(filtered, views.view(origin.into()).snapshot(), "seed {seed}");
            for pair in filtered.windows(2) {
                assert!(pair[0].timestamp() <= pair[1].timestamp(), "seed {seed}");
            }
            let bytes: Vec<u8> = filtered.iter().flat_map(|c| c.payload().to_vec()).collect();
            assert_eq!(&bytes, expected, "seed {seed}");
        }
    }
}

#[tokio::test]
async fn drop_oldest_loses_exactly_the_counted_chunks() {
    let capacity = 10;
    let bus = CaptureBus::new(capacity, BackpressurePolicy::DropOldest);
    let views = StreamViews::new(0);
    for i in 0..(capacity as u8 + 5) {
        bus.push(Chunk::new(Origin::Rx, &[i]).expect("chunk"))
            .await
            .expect("push");
    }
    drain_into(&bus, &views);

    assert_eq!(bus.overruns(), 5);
    let delivered: Vec<u8> = payloads(&views, ViewKind::Combined)
        .into_iter()
        .map(|p| p[0])
        .collect();
    assert_eq!(delivered, (5..15).collect::<Vec<u8>>());
}

#[tokio::test]
async fn rx_fault_leaves_tx_capture_running() {
    let (ports, mut tx_device, rx_device) = common::VirtualPorts::pair();
    let mut engine = Engine::with_connector(common::test_config(), ports);
    let mut lost = engine.port_lost_events();
    engine.start().await.expect("start");

    tx_device.write_all(b"before").await.expect("write");
    sleep(Duration::from_millis(40)).await;

    drop(rx_device);
    let event = tokio::time::timeout(Duration::from_secs(1), lost.recv())
        .await
        .expect("port lost in time")
        .expect("event");
    assert_eq!(event.origin, Origin::Rx);
    assert_eq!(event.port, common::RX_PORT);

    let combined_before = engine.views().view(ViewKind::Combined).len();
    for frame in [&b"one"[..], b"two", b"three"] {
        tx_device.write_all(frame).await.expect("write");
        sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(engine.state(), CaptureState::Running);

    let combined = engine.view_since(ViewKind::Combined, Cursor::START, 100);
    assert!(combined.chunks.len() > combined_before);
    assert!(combined.chunks.iter().all(|c| c.origin() == Origin::Tx));
    let tx_bytes: Vec<u8> = combined.chunks.iter().flat_map(|c| c.payload().to_vec()).collect();
    assert_eq!(tx_bytes, b"beforeonetwothree");

    assert!(lost.try_recv().is_err(), "port lost must be reported once");
    assert_eq!(engine.statistics().ports_lost, 1);

    engine.stop().await.expect("stop");
    assert_eq!(engine.state(), CaptureState::Idle);
}

#[tokio::test]
async fn statistics_follow_the_captured_traffic() {
    let (ports, mut tx_device, mut rx_device) = common::VirtualPorts::pair();
    let mut engine = Engine::with_connector(common::test_config(), ports);
    engine.start().await.expect("start");

    tx_device.write_all(b"AT+GMR\r\n").await.expect("write");
    sleep(Duration::from_millis(30)).await;
    rx_device.write_all(b"v2.1\r\n").await.expect("write");
    sleep(Duration::from_millis(30)).await;
    tx_device.write_all(b"AT\r\n").await.expect("write");
    sleep(Duration::from_millis(30)).await;
    engine.stop().await.expect("stop");

    let snapshot = engine.statistics();
    let tx_chunks = engine.views().view(ViewKind::Tx).snapshot();
    let tx_sum: usize = tx_chunks.iter().map(Chunk::len).sum();
    assert_eq!(snapshot.total_bytes_tx, tx_sum as u64);
    assert_eq!(snapshot.total_bytes_tx, 12);
    assert_eq!(snapshot.packet_count_tx, tx_chunks.len() as u64);
    assert_eq!(snapshot.total_bytes_rx, 6);
    let expected_avg = tx_sum as f64 / tx_chunks.len() as f64;
    assert!((snapshot.average_packet_size(Some(Origin::Tx)) - expected_avg).abs() < 1e-9);
    assert_eq!(snapshot.overruns, 0);
}

#[tokio::test]
async fn forwarding_bridges_the_two_ports() {
    let (ports, mut app, mut device) = common::VirtualPorts::pair();
    let mut config = common::test_config();
    config.forward = true;
    let mut engine = Engine::with_connector(config, ports);
    engine.start().await.expect("start");

    app.write_all(b"PING").await.expect("write");
    let mut at_device = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(1), device.read_exact(&mut at_device))
        .await
        .expect("forwarded in time")
        .expect("read");
    assert_eq!(&at_device, b"PING");

    device.write_all(b"PONG").await.expect("write");
    let mut at_app = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(1), app.read_exact(&mut at_app))
        .await
        .expect("forwarded in time")
        .expect("read");
    assert_eq!(&at_app, b"PONG");

    engine.stop().await.expect("stop");
    let origins: Vec<Origin> = engine
        .views()
        .view(ViewKind::Combined)
        .snapshot()
        .iter()
        .map(Chunk::origin)
        .collect();
    assert_eq!(origins, vec![Origin::Tx, Origin::Rx]);
}

#[tokio::test]
async fn stalled_forward_peer_blocks_neither_capture_nor_stop() {
    // the device end stays open but is never read
    let (ports, mut app, _device) = common::VirtualPorts::pair();
    let mut config = common::test_config();
    config.forward = true;
    let mut engine = Engine::with_connector(config, ports);
    engine.start().await.expect("start");

    let frame = [0x5Au8; 1024];
    for _ in 0..16 {
        tokio::time::timeout(Duration::from_millis(200), app.write_all(&frame))
            .await
            .expect("tx port keeps being drained")
            .expect("write");
    }
    let expected = 16 * frame.len() as u64;
    let deadline = Instant::now() + Duration::from_secs(2);
    while engine.statistics().total_bytes_tx < expected && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    tokio::time::timeout(Duration::from_millis(500), engine.stop())
        .await
        .expect("stop completes")
        .expect("stop");
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(engine.state(), CaptureState::Idle);

    let tx_bytes: usize = engine
        .views()
        .view(ViewKind::Tx)
        .snapshot()
        .iter()
        .map(Chunk::len)
        .sum();
    assert_eq!(tx_bytes as u64, expected);
}

#[tokio::test]
async fn stop_exports_every_accepted_chunk() {
    let tmp = tempdir().expect("temp dir");
    let export_path = tmp.path().join("capture.jsonl");
    let (ports, mut tx_device, mut rx_device) = common::VirtualPorts::pair();
    let mut config = common::test_config();
    config.export_path = Some(export_path.to_string_lossy().to_string());
    config.export_format = ExportFormat::JsonLines;
    let mut engine = Engine::with_connector(config, ports);
    engine.start().await.expect("start");

    tx_device.write_all(b"\x02GET\x03").await.expect("write");
    sleep(Duration::from_millis(30)).await;
    rx_device.write_all(b"\x06").await.expect("write");
    sleep(Duration::from_millis(30)).await;
    engine.stop().await.expect("stop");

    let content = std::fs::read_to_string(&export_path).expect("read export");
    let records: Vec<ExportRecord> = content
        .lines()
        .map(|line| serde_json::from_str(line).expect("record"))
        .collect();
    assert_eq!(records.len(), engine.views().view(ViewKind::Combined).len());
    assert_eq!(records[0].origin, Origin::Tx);
    assert_eq!(records[0].hex, "02 47 45 54 03");
    assert_eq!(records[0].ascii, ".GET.");
    assert_eq!(records[1].byte_length, 1);
    assert!(records[1].timestamp.ends_with('Z'));
}
