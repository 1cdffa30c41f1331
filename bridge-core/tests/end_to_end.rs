// End-to-end flow over the public API: registration files on disk, fake
// ZMQ terminals (PUB event stream + REP command socket), discovery via
// scan_and_connect, and leader->follower replication through the copier.

use hedge_edge_bridge_core::channel_reader::ChannelReader;
use hedge_edge_bridge_core::config::Config;
use hedge_edge_bridge_core::control::ControlServer;
use hedge_edge_bridge_core::copier::CopierEngine;
use hedge_edge_bridge_core::models::CopierGroup;
use hedge_edge_bridge_core::port_manager::PortManager;
use serial_test::serial;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A fake master terminal: PUB socket streaming frames, REP socket
/// answering commands and recording what it saw.
struct FakeTerminal {
    _ctx: zmq::Context,
    data_port: u16,
    command_port: u16,
    requests: Arc<Mutex<Vec<serde_json::Value>>>,
    /// one-shot frames drained by the PUB loop; CONNECTED repeats on its own
    pending_frames: Arc<Mutex<Vec<String>>>,
    stop: Arc<AtomicBool>,
}

impl FakeTerminal {
    fn spawn(login: &str) -> Self {
        let ctx = zmq::Context::new();

        let publisher = ctx.socket(zmq::PUB).unwrap();
        publisher.bind("tcp://127.0.0.1:*").unwrap();
        let data_port = port_of(&publisher);

        let rep = ctx.socket(zmq::REP).unwrap();
        rep.bind("tcp://127.0.0.1:*").unwrap();
        let command_port = port_of(&rep);

        let connected_frame = format!(
            r#"EVENT|{{"type":"CONNECTED","platform":"MT","accountId":"{}","data":{{"accountId":"{}","eventDriven":true,"balance":10000.0,"equity":10000.0,"positions":[]}}}}"#,
            login, login
        );
        let pending_frames: Arc<Mutex<Vec<String>>> = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));

        let pending_clone = pending_frames.clone();
        let stop_clone = stop.clone();
        std::thread::spawn(move || {
            while !stop_clone.load(Ordering::SeqCst) {
                // the heartbeat of the stream: CONNECTED repeats forever
                let _ = publisher.send(connected_frame.as_bytes(), 0);
                let drained: Vec<String> = pending_clone.lock().unwrap().drain(..).collect();
                for frame in drained {
                    let _ = publisher.send(frame.as_bytes(), 0);
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        });

        let requests: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let requests_clone = requests.clone();
        let account = login.to_string();
        let stop_clone = stop.clone();
        std::thread::spawn(move || {
            rep.set_rcvtimeo(200).unwrap();
            while !stop_clone.load(Ordering::SeqCst) {
                let raw = match rep.recv_string(0) {
                    Ok(Ok(raw)) => raw,
                    Ok(Err(_)) => continue,
                    Err(zmq::Error::EAGAIN) => continue,
                    Err(_) => break,
                };
                let request: serde_json::Value = serde_json::from_str(&raw).unwrap();
                let response = match request["action"].as_str().unwrap_or_default() {
                    "PING" => r#"{"success":true,"pong":true}"#.to_string(),
                    "STATUS" | "GET_ACCOUNT" => format!(
                        r#"{{"success":true,"accountId":"{}","balance":10000.0,"equity":10000.0,"positions":[]}}"#,
                        account
                    ),
                    "OPEN_POSITION" => r#"{"success":true,"ticket":98765}"#.to_string(),
                    "GET_HISTORY" => r#"{"success":true,"deals":[]}"#.to_string(),
                    _ => r#"{"success":true}"#.to_string(),
                };
                requests_clone.lock().unwrap().push(request);
                if rep.send(response.as_bytes(), 0).is_err() {
                    break;
                }
            }
        });

        Self {
            _ctx: ctx,
            data_port,
            command_port,
            requests,
            pending_frames,
            stop,
        }
    }

    fn publish(&self, frame: String) {
        self.pending_frames.lock().unwrap().push(frame);
    }

    fn requests_for(&self, action: &str) -> Vec<serde_json::Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r["action"] == action)
            .cloned()
            .collect()
    }
}

impl Drop for FakeTerminal {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn port_of(socket: &zmq::Socket) -> u16 {
    socket
        .get_last_endpoint()
        .unwrap()
        .unwrap()
        .rsplit(':')
        .next()
        .unwrap()
        .parse()
        .unwrap()
}

fn write_registration(dir: &std::path::Path, login: &str, data: u16, command: u16) {
    std::fs::write(
        dir.join(format!("{}.json", login)),
        format!(
            r#"{{"login":"{}","broker":"Demo","server":"Demo-01","dataPort":{},"commandPort":{},"role":"master","version":"1.0"}}"#,
            login, data, command
        ),
    )
    .unwrap();
}

fn reader_for(dir: &std::path::Path) -> Arc<ChannelReader> {
    let mut config = Config::default();
    config.discovery.registration_dir = dir.to_string_lossy().into_owned();
    config.discovery.fallback_port_pairs = Vec::new();
    config.zeromq.command_timeout_ms = 2_000;
    let port_manager = Arc::new(PortManager::default());
    let control = Arc::new(ControlServer::new(
        "licensed",
        "test",
        Duration::from_secs(30),
    ));
    ChannelReader::new(config, port_manager, control)
}

async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
#[serial]
async fn test_discovery_connects_publishing_master() {
    let terminal = FakeTerminal::spawn("100234");
    let dir = tempfile::tempdir().unwrap();
    write_registration(dir.path(), "100234", terminal.data_port, terminal.command_port);

    let reader = reader_for(dir.path());
    let connected = reader.scan_and_connect(true).await;
    assert_eq!(connected, vec!["100234".to_string()]);

    // PUB frames keep coming; the terminal stays alive without polling
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(reader.is_terminal_alive("100234").await);
    let snapshot = reader.get_last_snapshot("100234").await.unwrap();
    assert_eq!(snapshot.account_id, "100234");
    assert_eq!(snapshot.balance, 10_000.0);

    // commands route to the REP socket
    let pong = reader.ping("100234").await;
    assert!(pong.success);

    reader.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_leader_events_replicate_to_follower() {
    let leader = FakeTerminal::spawn("111111");
    let follower = FakeTerminal::spawn("222222");
    let dir = tempfile::tempdir().unwrap();
    write_registration(dir.path(), "111111", leader.data_port, leader.command_port);
    write_registration(
        dir.path(),
        "222222",
        follower.data_port,
        follower.command_port,
    );

    let reader = reader_for(dir.path());
    let mut connected = reader.scan_and_connect(true).await;
    connected.sort();
    assert_eq!(connected, vec!["111111".to_string(), "222222".to_string()]);

    let state_dir = tempfile::tempdir().unwrap();
    let engine = CopierEngine::new(
        reader.clone(),
        state_dir.path(),
        state_dir.path(),
        Duration::from_millis(100),
    );
    let groups: Vec<CopierGroup> = serde_json::from_value(serde_json::json!([{
        "id": "g1",
        "leaderAccountId": "111111",
        "enabled": true,
        "followers": [{
            "id": "f1",
            "accountId": "222222",
            "lotMultiplier": 2.0,
            "symbolSuffix": ".m"
        }]
    }]))
    .unwrap();
    engine.update_groups(groups).await;
    engine.start();

    // leader opens BUY 1.00 EURUSD; the frame is delivered twice to prove
    // duplicates collapse into one hedge
    let open_frame = r#"EVENT|{"type":"POSITION_OPENED","accountId":"111111","data":{"id":"12345","symbol":"EURUSD","side":"BUY","volumeLots":1.0,"entryPrice":1.1}}"#;
    leader.publish(open_frame.to_string());
    leader.publish(open_frame.to_string());

    let copied = wait_until(
        || !follower.requests_for("OPEN_POSITION").is_empty(),
        Duration::from_secs(10),
    )
    .await;
    assert!(copied, "follower never received the hedge open");

    let opens = follower.requests_for("OPEN_POSITION");
    // duplicate PUB frames must not produce duplicate hedges
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0]["symbol"], "EURUSD.m");
    assert_eq!(opens[0]["side"], "SELL");
    assert_eq!(opens[0]["volume"], 2.0);
    assert_eq!(opens[0]["comment"], "HE Copy 12345");

    let correlations = engine.correlations_for("12345").await;
    assert_eq!(correlations.len(), 1);
    assert_eq!(correlations[0].follower_ticket, "98765");

    // leader closes; the hedge is unwound
    leader.publish(
        r#"EVENT|{"type":"POSITION_CLOSED","accountId":"111111","data":{"id":"12345","symbol":"EURUSD","side":"BUY","volumeLots":1.0,"profit":50.0}}"#
            .to_string(),
    );
    let closed = wait_until(
        || !follower.requests_for("CLOSE_POSITION").is_empty(),
        Duration::from_secs(10),
    )
    .await;
    assert!(closed, "follower never received the hedge close");
    assert!(engine.correlations_for("12345").await.is_empty());

    // stats survive a restart through the persisted state files
    engine.shutdown().await;
    let restarted = CopierEngine::new(
        reader.clone(),
        state_dir.path(),
        state_dir.path(),
        Duration::from_millis(100),
    );
    let stats = restarted.get_group_stats().await;
    assert_eq!(stats.get("f1").map(|s| s.trades_total), Some(1));

    reader.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_safe_disconnect_releases_everything() {
    let terminal = FakeTerminal::spawn("100234");
    let dir = tempfile::tempdir().unwrap();
    write_registration(dir.path(), "100234", terminal.data_port, terminal.command_port);

    let reader = reader_for(dir.path());
    reader.scan_and_connect(true).await;
    assert!(reader.is_terminal_connected("100234").await);

    reader.safe_disconnect("100234").await;
    assert!(!reader.is_terminal_connected("100234").await);
    let response = reader.ping("100234").await;
    assert!(!response.success);

    // a fresh scan can reconnect because the ports were released
    let reconnected = reader.scan_and_connect(true).await;
    assert_eq!(reconnected, vec!["100234".to_string()]);

    reader.shutdown().await;
}
