// bridge-core/src/bridge/mod.rs
//
// One ZmqBridge per MT-style terminal. Masters own a SUB socket for the
// event stream and a REQ socket for commands; slaves own only the REQ
// socket and are kept alive by polled STATUS replies. ZMQ sockets are
// blocking, so each socket lives on its own spawn_blocking loop with a
// receive timeout and a shared shutdown flag.

mod normalize;


pub use normalize::SnapshotState;

use crate::models::{AccountSnapshot, CommandResponse, TerminalCommand, TerminalEvent};
use anyhow::{Context as AnyhowContext, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    Master,
    Slave,
}

/// Signals a bridge (or pipe client) pushes into the ChannelReader's intake.
#[derive(Debug, Clone)]
pub enum BridgeSignal {
    Event {
        terminal_id: String,
        event: TerminalEvent,
    },
    Error {
        terminal_id: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub host: String,
    pub data_port: Option<u16>,
    pub command_port: u16,
    pub mode: BridgeMode,
    pub curve_enabled: bool,
    pub curve_server_key: Option<String>,
    pub command_timeout: Duration,
    pub reconnect_interval: Duration,
    pub staleness: Duration,
}

impl BridgeOptions {
    pub fn master(host: &str, data_port: u16, command_port: u16) -> Self {
        Self {
            host: host.to_string(),
            data_port: Some(data_port),
            command_port,
            mode: BridgeMode::Master,
            curve_enabled: false,
            curve_server_key: None,
            command_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
            staleness: Duration::from_secs(15),
        }
    }

    pub fn slave(host: &str, command_port: u16) -> Self {
        Self {
            data_port: None,
            mode: BridgeMode::Slave,
            ..Self::master(host, 0, command_port)
        }
    }

    fn data_address(&self) -> Option<String> {
        self.data_port
            .map(|p| format!("tcp://{}:{}", self.host, p))
    }

    fn command_address(&self) -> String {
        format!("tcp://{}:{}", self.host, self.command_port)
    }
}

/// Last-traffic bookkeeping shared between socket loops and callers.
pub struct Liveness {
    last_message_at: Mutex<Option<Instant>>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_message_at: Mutex::new(None),
        }
    }

    pub fn touch(&self) {
        *self.last_message_at.lock().unwrap() = Some(Instant::now());
    }

    pub fn age(&self) -> Option<Duration> {
        self.last_message_at.lock().unwrap().map(|at| at.elapsed())
    }
}

struct PendingCommand {
    payload: String,
    timeout: Duration,
    respond: oneshot::Sender<CommandResponse>,
}

enum WorkerMsg {
    Command(PendingCommand),
    Shutdown,
}

pub struct ZmqBridge {
    terminal_id: String,
    options: BridgeOptions,
    ctx: zmq::Context,
    shutdown: Arc<AtomicBool>,
    sub_connected: Arc<AtomicBool>,
    req_connected: Arc<AtomicBool>,
    liveness: Arc<Liveness>,
    state: Arc<Mutex<SnapshotState>>,
    signal_tx: mpsc::UnboundedSender<BridgeSignal>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<WorkerMsg>>>,
    started: AtomicBool,
}

impl ZmqBridge {
    pub fn new(
        terminal_id: &str,
        options: BridgeOptions,
        signal_tx: mpsc::UnboundedSender<BridgeSignal>,
    ) -> Self {
        Self {
            terminal_id: terminal_id.to_string(),
            options,
            ctx: zmq::Context::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            sub_connected: Arc::new(AtomicBool::new(false)),
            req_connected: Arc::new(AtomicBool::new(false)),
            liveness: Arc::new(Liveness::new()),
            state: Arc::new(Mutex::new(SnapshotState::default())),
            signal_tx,
            cmd_tx: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub fn mode(&self) -> BridgeMode {
        self.options.mode
    }

    /// Spawn the socket loops. Idempotent; a second call is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock().unwrap() = Some(cmd_tx);
        self.spawn_command_worker(cmd_rx)?;

        if self.options.mode == BridgeMode::Master {
            self.spawn_sub_loop()?;
        }
        Ok(())
    }

    /// Stop both socket loops. Queued commands fail with "bridge stopped".
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(tx) = self.cmd_tx.lock().unwrap().take() {
            let _ = tx.send(WorkerMsg::Shutdown);
        }
        self.sub_connected.store(false, Ordering::SeqCst);
        self.req_connected.store(false, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
    }

    /// True iff the sockets are up: both for masters, REQ only for slaves.
    pub fn is_connected(&self) -> bool {
        let req = self.req_connected.load(Ordering::SeqCst);
        match self.options.mode {
            BridgeMode::Master => req && self.sub_connected.load(Ordering::SeqCst),
            BridgeMode::Slave => req,
        }
    }

    /// Connected and traffic seen within the staleness window.
    pub fn is_alive(&self) -> bool {
        self.is_connected()
            && self
                .liveness
                .age()
                .map(|age| age < self.options.staleness)
                .unwrap_or(false)
    }

    /// Slaves have no event stream; the poller calls this on each successful
    /// STATUS reply.
    pub fn mark_alive(&self) {
        self.liveness.touch();
    }

    /// True once any traffic has been observed on either socket.
    pub fn has_received(&self) -> bool {
        self.liveness.age().is_some()
    }

    pub fn last_snapshot(&self) -> Option<AccountSnapshot> {
        self.state.lock().unwrap().snapshot().cloned()
    }

    /// Run a frame through the normalization state machine. Exposed for the
    /// reader's slave polling, which feeds STATUS payloads through the same
    /// path as SUB frames.
    pub fn ingest_frame(&self, frame: &[u8]) -> Vec<TerminalEvent> {
        self.state.lock().unwrap().ingest_frame(&self.terminal_id, frame)
    }

    /// Serialize and enqueue a command. Strict FIFO: one REQ/REP exchange in
    /// flight at a time; each request carries its own timeout.
    pub async fn send_command(&self, command: &TerminalCommand) -> CommandResponse {
        let payload = match serde_json::to_string(command) {
            Ok(payload) => payload,
            Err(e) => return CommandResponse::failure(format!("serialize failed: {}", e)),
        };
        let tx = match self.cmd_tx.lock().unwrap().clone() {
            Some(tx) => tx,
            None => return CommandResponse::failure("bridge stopped"),
        };
        let (respond, rx) = oneshot::channel();
        if tx
            .send(WorkerMsg::Command(PendingCommand {
                payload,
                timeout: self.options.command_timeout,
                respond,
            }))
            .is_err()
        {
            return CommandResponse::failure("bridge stopped");
        }
        match rx.await {
            Ok(response) => response,
            Err(_) => CommandResponse::failure("bridge stopped"),
        }
    }

    fn spawn_sub_loop(&self) -> Result<()> {
        let ctx = self.ctx.clone();
        let terminal_id = self.terminal_id.clone();
        let address = self
            .options
            .data_address()
            .context("master bridge has no data port")?;
        let curve = self.curve_key();
        let shutdown = self.shutdown.clone();
        let connected = self.sub_connected.clone();
        let liveness = self.liveness.clone();
        let state = self.state.clone();
        let signal_tx = self.signal_tx.clone();
        let reconnect_interval = self.options.reconnect_interval;

        tokio::task::spawn_blocking(move || {
            while !shutdown.load(Ordering::SeqCst) {
                let socket = match open_sub_socket(&ctx, &address, curve.as_deref()) {
                    Ok(socket) => socket,
                    Err(e) => {
                        tracing::error!("[{}] Failed to open SUB socket: {}", terminal_id, e);
                        let _ = signal_tx.send(BridgeSignal::Error {
                            terminal_id: terminal_id.clone(),
                            message: format!("subscribe socket error: {}", e),
                        });
                        if wait_for_reconnect(&shutdown, reconnect_interval) {
                            continue;
                        }
                        break;
                    }
                };
                connected.store(true, Ordering::SeqCst);
                tracing::info!("[{}] SUB connected to {}", terminal_id, address);

                loop {
                    if shutdown.load(Ordering::SeqCst) {
                        drop(socket);
                        connected.store(false, Ordering::SeqCst);
                        return;
                    }
                    match socket.recv_bytes(0) {
                        Ok(frame) => {
                            liveness.touch();
                            let events = state
                                .lock()
                                .unwrap()
                                .ingest_frame(&terminal_id, &frame);
                            for event in events {
                                let _ = signal_tx.send(BridgeSignal::Event {
                                    terminal_id: terminal_id.clone(),
                                    event,
                                });
                            }
                        }
                        Err(zmq::Error::EAGAIN) => continue,
                        Err(e) => {
                            tracing::warn!(
                                "[{}] SUB receive error, reconnecting in {:?}: {}",
                                terminal_id,
                                reconnect_interval,
                                e
                            );
                            connected.store(false, Ordering::SeqCst);
                            let _ = signal_tx.send(BridgeSignal::Error {
                                terminal_id: terminal_id.clone(),
                                message: format!("receive error: {}", e),
                            });
                            break;
                        }
                    }
                }

                if !wait_for_reconnect(&shutdown, reconnect_interval) {
                    break;
                }
            }
            connected.store(false, Ordering::SeqCst);
            tracing::debug!("[{}] SUB loop exited", terminal_id);
        });
        Ok(())
    }

    fn spawn_command_worker(
        &self,
        mut cmd_rx: mpsc::UnboundedReceiver<WorkerMsg>,
    ) -> Result<()> {
        let ctx = self.ctx.clone();
        let terminal_id = self.terminal_id.clone();
        let address = self.options.command_address();
        let curve = self.curve_key();
        let connected = self.req_connected.clone();
        let liveness = self.liveness.clone();

        tokio::task::spawn_blocking(move || {
            let mut socket = match open_req_socket(&ctx, &address, curve.as_deref()) {
                Ok(socket) => {
                    connected.store(true, Ordering::SeqCst);
                    Some(socket)
                }
                Err(e) => {
                    tracing::error!("[{}] Failed to open REQ socket: {}", terminal_id, e);
                    None
                }
            };

            while let Some(msg) = cmd_rx.blocking_recv() {
                let pending = match msg {
                    WorkerMsg::Command(pending) => pending,
                    WorkerMsg::Shutdown => break,
                };

                let current = match socket.take() {
                    Some(socket) => socket,
                    None => match open_req_socket(&ctx, &address, curve.as_deref()) {
                        Ok(socket) => {
                            connected.store(true, Ordering::SeqCst);
                            socket
                        }
                        Err(e) => {
                            let _ = pending.respond.send(CommandResponse::failure(format!(
                                "request socket error: {}",
                                e
                            )));
                            continue;
                        }
                    },
                };

                let timeout_ms = pending.timeout.as_millis() as i32;
                let response = exchange(&current, &pending.payload, timeout_ms);
                match response {
                    Ok(response) => {
                        liveness.touch();
                        socket = Some(current);
                        let _ = pending.respond.send(response);
                    }
                    Err(e) => {
                        // A timed-out REQ socket is stuck mid-exchange; drop it
                        // and recreate lazily so later requests are not blocked.
                        tracing::warn!("[{}] Command failed: {}", terminal_id, e);
                        connected.store(false, Ordering::SeqCst);
                        drop(current);
                        let _ = pending.respond.send(CommandResponse::failure(e.to_string()));
                    }
                }
            }

            // Fail whatever is still queued so callers never hang.
            while let Ok(msg) = cmd_rx.try_recv() {
                if let WorkerMsg::Command(pending) = msg {
                    let _ = pending.respond.send(CommandResponse::failure("bridge stopped"));
                }
            }
            connected.store(false, Ordering::SeqCst);
            tracing::debug!("[{}] Command worker exited", terminal_id);
        });
        Ok(())
    }

    /// CURVE server key when transport encryption is on. Key material with
    /// curve_enabled=false is ignored with a warning.
    fn curve_key(&self) -> Option<String> {
        match (
            self.options.curve_enabled,
            self.options.curve_server_key.as_ref(),
        ) {
            (true, Some(key)) => Some(key.clone()),
            (true, None) => {
                tracing::warn!(
                    "[{}] curveEnabled without a server key; connecting plaintext",
                    self.terminal_id
                );
                None
            }
            (false, Some(_)) => {
                tracing::warn!(
                    "[{}] CURVE key supplied but curveEnabled=false; connecting plaintext",
                    self.terminal_id
                );
                None
            }
            (false, None) => None,
        }
    }
}

fn apply_curve(socket: &zmq::Socket, server_key: &str) -> Result<()> {
    let server = zmq::z85_decode(server_key)
        .map_err(|e| anyhow::anyhow!("invalid CURVE server key: {:?}", e))?;
    let keypair = zmq::CurveKeyPair::new().context("failed to generate CURVE keypair")?;
    socket.set_curve_serverkey(&server)?;
    socket.set_curve_publickey(&keypair.public_key)?;
    socket.set_curve_secretkey(&keypair.secret_key)?;
    Ok(())
}

fn open_sub_socket(
    ctx: &zmq::Context,
    address: &str,
    curve_server_key: Option<&str>,
) -> Result<zmq::Socket> {
    let socket = ctx.socket(zmq::SUB).context("Failed to create SUB socket")?;
    socket.set_rcvhwm(1000)?;
    socket.set_linger(0)?;
    if let Some(key) = curve_server_key {
        apply_curve(&socket, key)?;
    }
    socket.set_subscribe(b"EVENT|")?;
    socket.set_subscribe(b"SNAPSHOT|")?;
    socket.set_subscribe(b"")?;
    socket
        .connect(address)
        .context(format!("Failed to connect SUB to {}", address))?;
    // Receive timeout so the loop can observe the shutdown flag
    socket.set_rcvtimeo(100)?;
    Ok(socket)
}

fn open_req_socket(
    ctx: &zmq::Context,
    address: &str,
    curve_server_key: Option<&str>,
) -> Result<zmq::Socket> {
    let socket = ctx.socket(zmq::REQ).context("Failed to create REQ socket")?;
    socket.set_linger(0)?;
    if let Some(key) = curve_server_key {
        apply_curve(&socket, key)?;
    }
    socket
        .connect(address)
        .context(format!("Failed to connect REQ to {}", address))?;
    Ok(socket)
}

/// One strict send-then-receive exchange with a per-request timeout.
fn exchange(socket: &zmq::Socket, payload: &str, timeout_ms: i32) -> Result<CommandResponse> {
    socket.set_sndtimeo(timeout_ms)?;
    socket.set_rcvtimeo(timeout_ms)?;
    socket
        .send(payload.as_bytes(), 0)
        .map_err(|e| anyhow::anyhow!("send failed: {}", e))?;
    let reply = socket.recv_bytes(0).map_err(|e| match e {
        zmq::Error::EAGAIN => anyhow::anyhow!("command timed out"),
        other => anyhow::anyhow!("receive failed: {}", other),
    })?;
    serde_json::from_slice(&reply).map_err(|e| anyhow::anyhow!("invalid response: {}", e))
}

/// Sleep in shutdown-aware slices. Returns false when shutting down.
fn wait_for_reconnect(shutdown: &AtomicBool, interval: Duration) -> bool {
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    !shutdown.load(Ordering::SeqCst)
}
