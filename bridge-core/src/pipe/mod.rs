// bridge-core/src/pipe/mod.rs
//
// Named-pipe client for cTrader-style terminals: a data pipe streaming
// newline-delimited JSON frames and a command pipe speaking one-at-a-time
// request/response. The protocol layer is written against AsyncRead +
// AsyncWrite; the connector is Windows named pipes on Windows and a Unix
// socket at the equivalent path elsewhere, which also keeps the protocol
// testable over in-memory duplex streams.

use crate::bridge::{BridgeSignal, SnapshotState};
use crate::models::{CommandResponse, HeartbeatUpdate, TerminalCommand, TerminalEvent};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};


/// Frames larger than this indicate a peer gone haywire; the buffer is
/// cleared and streaming continues.
const DATA_BUFFER_CAP: usize = 1024 * 1024;

pub trait PipeStream:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send
{
}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> PipeStream for T {}

#[derive(Debug, Clone)]
pub struct PipeEndpoints {
    pub data: String,
    pub command: String,
}

impl PipeEndpoints {
    /// Endpoint paths for one terminal under the configured prefix.
    pub fn for_terminal(prefix: &str, terminal_id: &str) -> Self {
        #[cfg(windows)]
        {
            Self {
                data: format!(r"\\.\pipe\{}-{}-data", prefix, terminal_id),
                command: format!(r"\\.\pipe\{}-{}-command", prefix, terminal_id),
            }
        }
        #[cfg(not(windows))]
        {
            let base = std::env::temp_dir();
            Self {
                data: base
                    .join(format!("{}-{}-data.sock", prefix, terminal_id))
                    .to_string_lossy()
                    .into_owned(),
                command: base
                    .join(format!("{}-{}-command.sock", prefix, terminal_id))
                    .to_string_lossy()
                    .into_owned(),
            }
        }
    }
}

#[cfg(not(windows))]
async fn connect_stream(path: &str) -> std::io::Result<Box<dyn PipeStream>> {
    Ok(Box::new(tokio::net::UnixStream::connect(path).await?))
}

#[cfg(windows)]
async fn connect_stream(path: &str) -> std::io::Result<Box<dyn PipeStream>> {
    Ok(Box::new(
        tokio::net::windows::named_pipe::ClientOptions::new().open(path)?,
    ))
}

#[derive(Debug, Clone)]
pub struct PipeOptions {
    pub reconnect_interval: Duration,
    pub command_timeout: Duration,
    pub staleness: Duration,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            staleness: Duration::from_secs(15),
        }
    }
}

pub struct PipeClient {
    terminal_id: String,
    endpoints: PipeEndpoints,
    options: PipeOptions,
    signal_tx: mpsc::UnboundedSender<BridgeSignal>,
    state: Arc<StdMutex<SnapshotState>>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    last_frame_at: Arc<StdMutex<Option<Instant>>>,
    /// One in-flight command at a time; FIFO by lock acquisition order
    command_lock: Mutex<()>,
    started: AtomicBool,
}

impl PipeClient {
    pub fn new(
        terminal_id: &str,
        endpoints: PipeEndpoints,
        options: PipeOptions,
        signal_tx: mpsc::UnboundedSender<BridgeSignal>,
    ) -> Self {
        Self {
            terminal_id: terminal_id.to_string(),
            endpoints,
            options,
            signal_tx,
            state: Arc::new(StdMutex::new(SnapshotState::default())),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            last_frame_at: Arc::new(StdMutex::new(None)),
            command_lock: Mutex::new(()),
            started: AtomicBool::new(false),
        }
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    /// Spawn the data-pipe reader with its reconnect loop.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let terminal_id = self.terminal_id.clone();
        let data_path = self.endpoints.data.clone();
        let signal_tx = self.signal_tx.clone();
        let state = self.state.clone();
        let connected = self.connected.clone();
        let shutdown = self.shutdown.clone();
        let last_frame_at = self.last_frame_at.clone();
        let reconnect_interval = self.options.reconnect_interval;

        tokio::spawn(async move {
            while !shutdown.load(Ordering::SeqCst) {
                match connect_stream(&data_path).await {
                    Ok(stream) => {
                        tracing::info!("[{}] Data pipe connected: {}", terminal_id, data_path);
                        connected.store(true, Ordering::SeqCst);
                        read_data_frames(
                            stream,
                            &terminal_id,
                            &state,
                            &signal_tx,
                            &shutdown,
                            &last_frame_at,
                        )
                        .await;
                        connected.store(false, Ordering::SeqCst);
                        if !shutdown.load(Ordering::SeqCst) {
                            tracing::warn!(
                                "[{}] Data pipe closed, reconnecting in {:?}",
                                terminal_id,
                                reconnect_interval
                            );
                            let _ = signal_tx.send(BridgeSignal::Event {
                                terminal_id: terminal_id.clone(),
                                event: TerminalEvent::Disconnected {
                                    reason: Some("pipe closed".to_string()),
                                },
                            });
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            "[{}] Data pipe connect failed ({}), retrying in {:?}",
                            terminal_id,
                            e,
                            reconnect_interval
                        );
                    }
                }
                tokio::time::sleep(reconnect_interval).await;
            }
            tracing::debug!("[{}] Data pipe loop exited", terminal_id);
        });
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.is_connected()
            && self
                .last_frame_at
                .lock()
                .unwrap()
                .map(|at| at.elapsed() < self.options.staleness)
                .unwrap_or(false)
    }

    pub fn last_snapshot(&self) -> Option<crate::models::AccountSnapshot> {
        self.state.lock().unwrap().snapshot().cloned()
    }

    /// One JSON-line request, one JSON-line response, per-request timeout.
    /// The command mutex keeps a single command in flight.
    pub async fn send_command(&self, command: &TerminalCommand) -> CommandResponse {
        let payload = match serde_json::to_string(command) {
            Ok(payload) => payload,
            Err(e) => return CommandResponse::failure(format!("serialize failed: {}", e)),
        };
        let _guard = self.command_lock.lock().await;
        if self.shutdown.load(Ordering::SeqCst) {
            return CommandResponse::failure("pipe closed");
        }

        let exchange = async {
            let stream = connect_stream(&self.endpoints.command)
                .await
                .map_err(|_| "pipe closed".to_string())?;
            let (reader, mut writer) = tokio::io::split(stream);
            writer
                .write_all(format!("{}\n", payload).as_bytes())
                .await
                .map_err(|_| "pipe closed".to_string())?;
            writer.flush().await.map_err(|_| "pipe closed".to_string())?;

            let mut line = String::new();
            let mut reader = BufReader::new(reader);
            use tokio::io::AsyncBufReadExt;
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|_| "pipe closed".to_string())?;
            if n == 0 {
                return Err("pipe closed".to_string());
            }
            serde_json::from_str::<CommandResponse>(&line)
                .map_err(|e| format!("invalid response: {}", e))
        };

        match tokio::time::timeout(self.options.command_timeout, exchange).await {
            Ok(Ok(response)) => {
                *self.last_frame_at.lock().unwrap() = Some(Instant::now());
                response
            }
            Ok(Err(e)) => CommandResponse::failure(e),
            Err(_) => CommandResponse::failure("command timed out"),
        }
    }
}

async fn read_data_frames(
    stream: Box<dyn PipeStream>,
    terminal_id: &str,
    state: &Arc<StdMutex<SnapshotState>>,
    signal_tx: &mpsc::UnboundedSender<BridgeSignal>,
    shutdown: &Arc<AtomicBool>,
    last_frame_at: &Arc<StdMutex<Option<Instant>>>,
) {
    let (reader, _writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8 * 1024];

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let read = tokio::time::timeout(Duration::from_secs(1), reader.read(&mut chunk)).await;
        let n = match read {
            // timeout: idle pipe, poll the shutdown flag again
            Err(_) => continue,
            Ok(Ok(0)) => return,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::warn!("[{}] Data pipe read error: {}", terminal_id, e);
                return;
            }
        };

        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > DATA_BUFFER_CAP {
            tracing::warn!(
                "[{}] Data pipe buffer overflow ({} bytes), clearing",
                terminal_id,
                buffer.len()
            );
            buffer.clear();
            continue;
        }

        for line in drain_lines(&mut buffer) {
            *last_frame_at.lock().unwrap() = Some(Instant::now());
            let events = ingest_data_line(state, terminal_id, &line);
            for event in events {
                let _ = signal_tx.send(BridgeSignal::Event {
                    terminal_id: terminal_id.to_string(),
                    event,
                });
            }
        }
    }
}

/// Split complete newline-terminated frames off the front of the buffer,
/// leaving any partial trailing frame in place.
pub(crate) fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(idx) = buffer.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=idx).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Normalize one data-pipe frame: an account snapshot (same shape as the ZMQ
/// transport), a LICENSE_STATUS, or a GOODBYE.
pub(crate) fn ingest_data_line(
    state: &Arc<StdMutex<SnapshotState>>,
    terminal_id: &str,
    line: &[u8],
) -> Vec<TerminalEvent> {
    let value: Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("[{}] Dropping unparseable pipe frame: {}", terminal_id, e);
            return Vec::new();
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some("LICENSE_STATUS") => {
            let is_valid = value
                .get("isValid")
                .or_else(|| value.get("isLicenseValid"))
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            let update = HeartbeatUpdate {
                is_license_valid: Some(is_valid),
                ..Default::default()
            };
            state.lock().unwrap().merge_heartbeat(&update);
            vec![TerminalEvent::Heartbeat(update)]
        }
        Some(_) => state
            .lock()
            .unwrap()
            .ingest_frame(terminal_id, line),
        None => {
            // bare snapshot frame: route it through the legacy SNAPSHOT path
            let mut tagged = value;
            if let Some(obj) = tagged.as_object_mut() {
                obj.insert("type".to_string(), Value::String("SNAPSHOT".to_string()));
            }
            let bytes = match serde_json::to_vec(&tagged) {
                Ok(bytes) => bytes,
                Err(_) => return Vec::new(),
            };
            state.lock().unwrap().ingest_frame(terminal_id, &bytes)
        }
    }
}
