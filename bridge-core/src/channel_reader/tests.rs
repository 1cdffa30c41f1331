use super::*;
use crate::bridge::BridgeOptions;
use crate::config::Config;
use crate::models::EventKind;
use serial_test::serial;

fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.discovery.registration_dir = dir.to_string_lossy().into_owned();
    config.discovery.fallback_port_pairs = Vec::new();
    config.zeromq.command_timeout_ms = 2_000;
    config
}

fn reader_with(dir: &std::path::Path) -> Arc<ChannelReader> {
    let config = test_config(dir);
    let port_manager = Arc::new(PortManager::default());
    let control = Arc::new(ControlServer::new("hint", "test", Duration::from_secs(30)));
    ChannelReader::new(config, port_manager, control)
}

/// A fake master terminal: a REP socket answering PING/STATUS and an
/// optional PUB socket streaming frames.
struct FakeTerminal {
    _ctx: zmq::Context,
    pub command_port: u16,
    pub data_port: u16,
    _data_listener: Option<std::net::TcpListener>,
}

impl FakeTerminal {
    /// REP-only terminal; the data port is a plain TCP listener so probing
    /// succeeds but no PUB traffic ever arrives.
    fn silent_master(status_payload: &str) -> Self {
        let ctx = zmq::Context::new();
        let rep = ctx.socket(zmq::REP).unwrap();
        rep.bind("tcp://127.0.0.1:*").unwrap();
        let endpoint = rep.get_last_endpoint().unwrap().unwrap();
        let command_port: u16 = endpoint.rsplit(':').next().unwrap().parse().unwrap();

        let data_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let data_port = data_listener.local_addr().unwrap().port();

        let payload = status_payload.to_string();
        std::thread::spawn(move || loop {
            let request = match rep.recv_string(0) {
                Ok(Ok(request)) => request,
                _ => break,
            };
            let response = if request.contains("\"PING\"") {
                r#"{"success":true,"pong":true}"#.to_string()
            } else if request.contains("\"STATUS\"") {
                payload.clone()
            } else {
                r#"{"success":true}"#.to_string()
            };
            if rep.send(response.as_bytes(), 0).is_err() {
                break;
            }
        });

        Self {
            _ctx: ctx,
            command_port,
            data_port,
            _data_listener: Some(data_listener),
        }
    }
}

fn write_registration(dir: &std::path::Path, login: &str, data: u16, command: u16) {
    std::fs::write(
        dir.join(format!("{}.json", login)),
        format!(
            r#"{{"login":"{}","broker":"Demo","dataPort":{},"commandPort":{}}}"#,
            login, data, command
        ),
    )
    .unwrap();
}

#[tokio::test]
async fn test_send_command_without_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let reader = reader_with(dir.path());
    let response = reader.ping("nope").await;
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("Terminal not connected"));
    reader.shutdown().await;
}

#[tokio::test]
async fn test_safe_disconnect_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let reader = reader_with(dir.path());

    let bridge = Arc::new(ZmqBridge::new(
        "100234",
        BridgeOptions::slave("127.0.0.1", 51999),
        reader.signal_tx.clone(),
    ));
    reader
        .links
        .write()
        .await
        .insert("100234".to_string(), TerminalLink::Zmq(bridge));
    reader
        .port_manager
        .allocate(51999, crate::port_manager::PortOwner::ZmqCommand, "100234")
        .await;

    reader.safe_disconnect("100234").await;
    assert!(!reader.is_terminal_connected("100234").await);
    assert!(reader.port_manager.allocation(51999).await.is_none());

    // second call is a no-op
    reader.safe_disconnect("100234").await;
    reader.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_scan_connects_silent_master_via_ping_fallback() {
    // Boundary: probe succeeds, no PUB event within the wait, PING succeeds,
    // STATUS delivers the snapshot, a synthetic CONNECTED is emitted.
    let terminal = FakeTerminal::silent_master(
        r#"{"success":true,"accountId":"100234","balance":10000.0,"equity":10000.0,"positions":[]}"#,
    );
    let dir = tempfile::tempdir().unwrap();
    write_registration(
        dir.path(),
        "100234",
        terminal.data_port,
        terminal.command_port,
    );

    let reader = reader_with(dir.path());
    let mut events = reader.subscribe();

    let connected = reader.scan_and_connect(true).await;
    assert_eq!(connected, vec!["100234".to_string()]);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event")
        .unwrap();
    match event {
        ReaderEvent::TerminalConnected {
            terminal_id,
            snapshot,
        } => {
            assert_eq!(terminal_id, "100234");
            assert_eq!(snapshot.account_id, "100234");
            assert_eq!(snapshot.balance, 10_000.0);
        }
        other => panic!("expected TerminalConnected, got {:?}", other),
    }

    assert!(reader.is_terminal_alive("100234").await);
    assert!(reader.get_last_snapshot("100234").await.is_some());

    // a PING routed through the reader reaches the fake terminal
    let pong = reader.ping("100234").await;
    assert!(pong.success);

    reader.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_scan_skips_dead_candidates() {
    let dir = tempfile::tempdir().unwrap();
    // nothing listens on these ports
    write_registration(dir.path(), "100234", 52710, 52711);

    let reader = reader_with(dir.path());
    let connected = reader.scan_and_connect(true).await;
    assert!(connected.is_empty());
    assert!(!reader.is_terminal_connected("100234").await);
    reader.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_scan_result_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    let reader = reader_with(dir.path());

    let first = reader.scan_and_connect(false).await;
    // seed the cache with a sentinel to prove the second call short-circuits
    *reader.scan_cache.lock().await =
        Some((Instant::now(), vec!["cached-sentinel".to_string()]));
    let second = reader.scan_and_connect(false).await;
    assert!(first.is_empty());
    assert_eq!(second, vec!["cached-sentinel".to_string()]);

    // forced scan ignores the cache
    let forced = reader.scan_and_connect(true).await;
    assert!(forced.is_empty());
    reader.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_concurrent_scans_converge() {
    let dir = tempfile::tempdir().unwrap();
    let reader = reader_with(dir.path());

    let a = reader.clone();
    let b = reader.clone();
    let (first, second) = tokio::join!(a.scan_and_connect(false), b.scan_and_connect(false));
    assert_eq!(first, second);
    reader.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_slave_status_diff_synthesizes_events() {
    let dir = tempfile::tempdir().unwrap();
    let reader = reader_with(dir.path());
    let mut events = reader.subscribe();

    let bridge = Arc::new(ZmqBridge::new(
        "200555",
        BridgeOptions::slave("127.0.0.1", 51999),
        reader.signal_tx.clone(),
    ));
    reader
        .links
        .write()
        .await
        .insert("200555".to_string(), TerminalLink::Zmq(bridge.clone()));

    let with_position: CommandResponse = serde_json::from_str(
        r#"{"success":true,"accountId":"200555","balance":5000.0,"equity":5000.0,
            "positions":[{"id":"42","symbol":"EURUSD","side":"SELL","volumeLots":1.0,
            "profit":10.0,"swap":0.0,"commission":-1.0}]}"#,
    )
    .unwrap();
    let without_position: CommandResponse = serde_json::from_str(
        r#"{"success":true,"accountId":"200555","balance":5009.0,"equity":5009.0,"positions":[]}"#,
    )
    .unwrap();

    reader.ingest_status_payload(&bridge, &with_position);
    reader.ingest_status_payload(&bridge, &without_position);

    // first payload: CONNECTED
    let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, ReaderEvent::TerminalConnected { .. }));

    // second payload: synthetic close from the diff
    let second = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    match second {
        ReaderEvent::Terminal { terminal_id, event } => {
            assert_eq!(terminal_id, "200555");
            assert_eq!(event.kind(), EventKind::PositionClosed);
            if let TerminalEvent::PositionClosed(closed) = event {
                assert_eq!(closed.position.id, "42");
                assert_eq!(closed.position.profit, 9.0);
            }
        }
        other => panic!("expected position close, got {:?}", other),
    }

    reader.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_is_lightweight_and_silent_on_cache() {
    let dir = tempfile::tempdir().unwrap();
    let reader = reader_with(dir.path());
    let mut events = reader.subscribe();

    let bridge = Arc::new(ZmqBridge::new(
        "100234",
        BridgeOptions::slave("127.0.0.1", 51999),
        reader.signal_tx.clone(),
    ));
    reader
        .links
        .write()
        .await
        .insert("100234".to_string(), TerminalLink::Zmq(bridge.clone()));

    // seed a snapshot, then a heartbeat with new equity
    bridge.ingest_frame(
        br#"{"type":"SNAPSHOT","accountId":"100234","balance":1000.0,"equity":1000.0}"#,
    );
    let hb_events =
        bridge.ingest_frame(br#"{"type":"HEARTBEAT","data":{"equity":1100.0,"floatingPnL":100.0}}"#);
    reader.ingest_status_events(&bridge, hb_events);

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        ReaderEvent::Heartbeat {
            terminal_id,
            equity,
            ..
        } => {
            assert_eq!(terminal_id, "100234");
            assert_eq!(equity, Some(1100.0));
        }
        other => panic!("expected heartbeat, got {:?}", other),
    }

    // merged silently into the cache
    let snapshot = reader.get_last_snapshot("100234").await.unwrap();
    assert_eq!(snapshot.equity, 1100.0);
    assert_eq!(snapshot.balance, 1000.0);

    reader.shutdown().await;
}
