use super::*;
use serial_test::serial;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn server() -> ControlServer {
    ControlServer::new("licensed", "1.0.0-test", Duration::from_secs(30))
}

#[tokio::test]
#[serial]
async fn test_enable_sent_on_bind_and_ack_marks_connected() {
    let port = free_port();
    let control = server();
    let mut events = control.subscribe();
    control.open_channel("100234", port).unwrap();

    // Terminal-side agent end of the gate
    let (enable_frame, acked) = tokio::task::spawn_blocking(move || {
        let ctx = zmq::Context::new();
        let pair = ctx.socket(zmq::PAIR).unwrap();
        pair.set_rcvtimeo(2_000).unwrap();
        pair.connect(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let frame = pair.recv_string(0).unwrap().unwrap();
        pair.send(br#"{"action":"ACK"}"#.to_vec(), 0).unwrap();
        // give the receive loop a beat to process the ACK
        std::thread::sleep(Duration::from_millis(300));
        (frame, true)
    })
    .await
    .unwrap();

    assert!(acked);
    let enable: serde_json::Value = serde_json::from_str(&enable_frame).unwrap();
    assert_eq!(enable["action"], "ENABLE");
    assert_eq!(enable["terminalId"], "100234");
    assert_eq!(enable["appVersion"], "1.0.0-test");
    assert!(enable["sessionId"].as_str().unwrap().len() > 10);

    assert_eq!(control.status("100234"), Some(ChannelStatus::Connected));
    match events.recv().await.unwrap() {
        ControlEvent::Connected { terminal_id } => assert_eq!(terminal_id, "100234"),
        other => panic!("unexpected event {:?}", other),
    }

    control.close_channel("100234", "test done");
}

#[tokio::test]
#[serial]
async fn test_disable_sent_on_close() {
    let port = free_port();
    let control = server();
    control.open_channel("100234", port).unwrap();

    let handle = tokio::task::spawn_blocking(move || {
        let ctx = zmq::Context::new();
        let pair = ctx.socket(zmq::PAIR).unwrap();
        pair.set_rcvtimeo(2_000).unwrap();
        pair.connect(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        // first frame is ENABLE
        let _enable = pair.recv_string(0).unwrap().unwrap();
        // next frame should be the best-effort DISABLE
        pair.recv_string(0).unwrap().unwrap()
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    control.close_channel("100234", "terminal removed");

    let disable = handle.await.unwrap();
    let frame: serde_json::Value = serde_json::from_str(&disable).unwrap();
    assert_eq!(frame["action"], "DISABLE");
    assert_eq!(frame["reason"], "terminal removed");
}

#[tokio::test]
#[serial]
async fn test_bind_conflict_marks_error() {
    let port = free_port();
    // occupy the port with another PAIR bind
    let ctx = zmq::Context::new();
    let occupier = ctx.socket(zmq::PAIR).unwrap();
    occupier
        .bind(&format!("tcp://127.0.0.1:{}", port))
        .unwrap();

    let control = server();
    control.open_channel("100234", port).unwrap();
    // the bind failure happens on the blocking task
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(control.status("100234"), Some(ChannelStatus::Error));
}

#[tokio::test]
#[serial]
async fn test_non_json_inbound_is_ignored() {
    let port = free_port();
    let control = server();
    control.open_channel("100234", port).unwrap();

    tokio::task::spawn_blocking(move || {
        let ctx = zmq::Context::new();
        let pair = ctx.socket(zmq::PAIR).unwrap();
        pair.set_rcvtimeo(2_000).unwrap();
        pair.connect(&format!("tcp://127.0.0.1:{}", port)).unwrap();
        let _enable = pair.recv_string(0).unwrap().unwrap();
        pair.send(b"garbage".to_vec(), 0).unwrap();
        std::thread::sleep(Duration::from_millis(200));
    })
    .await
    .unwrap();

    // channel survives, still pending (garbage is not an ACK)
    assert_eq!(control.status("100234"), Some(ChannelStatus::Pending));
    control.close_channel("100234", "done");
}

#[tokio::test]
async fn test_open_channel_is_idempotent() {
    let port = free_port();
    let control = server();
    control.open_channel("100234", port).unwrap();
    control.open_channel("100234", port).unwrap();
    assert!(control.status("100234").is_some());
    control.shutdown();
    assert!(control.status("100234").is_none());
}
