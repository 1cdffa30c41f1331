// bridge-core/src/channel_reader/mod.rs
//
// The single public surface for terminal messaging. Owns every bridge and
// pipe client, the snapshot cache, discovery state, and command routing.
// Bridges push BridgeSignals into the intake channel; the intake task updates
// the cache and fans events out to subscribers over a broadcast channel, so a
// slow or panicking listener can never affect a receive loop.

mod discovery;

#[cfg(test)]
mod tests;

pub use discovery::ConnectOptions;

use crate::bridge::{BridgeMode, BridgeSignal, ZmqBridge};
use crate::config::Config;
use crate::control::ControlServer;
use crate::models::{
    AccountSnapshot, CommandResponse, TerminalCommand, TerminalEvent, TradeSide,
};
use crate::pipe::PipeClient;
use crate::port_manager::PortManager;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

const SLAVE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const HISTORY_DELAY: Duration = Duration::from_secs(5);
const HISTORY_DAYS: u32 = 3650;

/// Events the reader fans out to its subscribers.
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    TerminalConnected {
        terminal_id: String,
        snapshot: AccountSnapshot,
    },
    TerminalDisconnected {
        terminal_id: String,
        reason: Option<String>,
    },
    /// Lightweight health signal; full state stays in the snapshot cache
    Heartbeat {
        terminal_id: String,
        equity: Option<f64>,
        floating_pnl: Option<f64>,
    },
    TradeHistory {
        terminal_id: String,
        deals: Value,
    },
    /// Trade and order events, forwarded immediately
    Terminal {
        terminal_id: String,
        event: TerminalEvent,
    },
    Error {
        terminal_id: String,
        message: String,
    },
}

#[derive(Clone)]
pub enum TerminalLink {
    Zmq(Arc<ZmqBridge>),
    Pipe(Arc<PipeClient>),
}

impl TerminalLink {
    pub fn is_connected(&self) -> bool {
        match self {
            TerminalLink::Zmq(bridge) => bridge.is_connected(),
            TerminalLink::Pipe(pipe) => pipe.is_connected(),
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            TerminalLink::Zmq(bridge) => bridge.is_alive(),
            TerminalLink::Pipe(pipe) => pipe.is_alive(),
        }
    }

    pub fn is_slave(&self) -> bool {
        matches!(self, TerminalLink::Zmq(bridge) if bridge.mode() == BridgeMode::Slave)
    }

    pub fn stop(&self) {
        match self {
            TerminalLink::Zmq(bridge) => bridge.stop(),
            TerminalLink::Pipe(pipe) => pipe.stop(),
        }
    }

    pub fn last_snapshot(&self) -> Option<AccountSnapshot> {
        match self {
            TerminalLink::Zmq(bridge) => bridge.last_snapshot(),
            TerminalLink::Pipe(pipe) => pipe.last_snapshot(),
        }
    }

    pub async fn send_command(&self, command: &TerminalCommand) -> CommandResponse {
        match self {
            TerminalLink::Zmq(bridge) => bridge.send_command(command).await,
            TerminalLink::Pipe(pipe) => pipe.send_command(command).await,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedSnapshot {
    snapshot: AccountSnapshot,
    updated_at: Instant,
}

#[derive(Debug, Clone)]
pub struct OpenPositionRequest {
    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub magic: Option<i64>,
    pub comment: Option<String>,
    pub deviation: Option<u32>,
}

pub struct ChannelReader {
    pub(crate) config: Config,
    pub(crate) registration_dir: PathBuf,
    pub(crate) port_manager: Arc<PortManager>,
    pub(crate) control: Arc<ControlServer>,
    pub(crate) links: RwLock<HashMap<String, TerminalLink>>,
    snapshots: RwLock<HashMap<String, CachedSnapshot>>,
    slave_polls: StdMutex<HashMap<String, JoinHandle<()>>>,
    pub(crate) scan_cache: Mutex<Option<(Instant, Vec<String>)>>,
    pub(crate) signal_tx: mpsc::UnboundedSender<BridgeSignal>,
    events_tx: broadcast::Sender<ReaderEvent>,
    intake_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl ChannelReader {
    pub fn new(
        config: Config,
        port_manager: Arc<PortManager>,
        control: Arc<ControlServer>,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(1024);
        let registration_dir = PathBuf::from(&config.discovery.registration_dir);

        let reader = Arc::new(Self {
            config,
            registration_dir,
            port_manager,
            control,
            links: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            slave_polls: StdMutex::new(HashMap::new()),
            scan_cache: Mutex::new(None),
            signal_tx,
            events_tx,
            intake_handle: StdMutex::new(None),
        });

        let handle = tokio::spawn(Self::run_intake(reader.clone(), signal_rx));
        *reader.intake_handle.lock().unwrap() = Some(handle);
        reader
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReaderEvent> {
        self.events_tx.subscribe()
    }

    // -- snapshot cache ----------------------------------------------------

    pub async fn get_last_snapshot(&self, terminal_id: &str) -> Option<AccountSnapshot> {
        self.snapshots
            .read()
            .await
            .get(terminal_id)
            .map(|c| c.snapshot.clone())
    }

    pub async fn snapshot_age(&self, terminal_id: &str) -> Option<Duration> {
        self.snapshots
            .read()
            .await
            .get(terminal_id)
            .map(|c| c.updated_at.elapsed())
    }

    pub async fn connected_terminals(&self) -> Vec<String> {
        self.links
            .read()
            .await
            .iter()
            .filter(|(_, link)| link.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn is_terminal_connected(&self, terminal_id: &str) -> bool {
        self.links
            .read()
            .await
            .get(terminal_id)
            .map(|link| link.is_connected())
            .unwrap_or(false)
    }

    pub async fn is_terminal_alive(&self, terminal_id: &str) -> bool {
        self.links
            .read()
            .await
            .get(terminal_id)
            .map(|link| link.is_alive())
            .unwrap_or(false)
    }

    pub async fn is_slave_terminal(&self, terminal_id: &str) -> bool {
        self.links
            .read()
            .await
            .get(terminal_id)
            .map(|link| link.is_slave())
            .unwrap_or(false)
    }

    // -- command routing ---------------------------------------------------

    /// Resolve the transport for a terminal and send the command over it.
    pub async fn send_command(
        &self,
        terminal_id: &str,
        command: &TerminalCommand,
    ) -> CommandResponse {
        let link = self.links.read().await.get(terminal_id).cloned();
        match link {
            Some(link) if link.is_connected() => link.send_command(command).await,
            _ => CommandResponse::failure("Terminal not connected"),
        }
    }

    pub async fn open_position(
        &self,
        terminal_id: &str,
        request: OpenPositionRequest,
    ) -> CommandResponse {
        self.send_command(
            terminal_id,
            &TerminalCommand::OpenPosition {
                symbol: request.symbol,
                side: request.side,
                volume: request.volume,
                sl: request.sl,
                tp: request.tp,
                magic: request.magic,
                comment: request.comment,
                deviation: request.deviation,
            },
        )
        .await
    }

    pub async fn modify_position(
        &self,
        terminal_id: &str,
        ticket: &str,
        sl: Option<f64>,
        tp: Option<f64>,
    ) -> CommandResponse {
        self.send_command(
            terminal_id,
            &TerminalCommand::ModifyPosition {
                ticket: ticket.to_string(),
                sl,
                tp,
            },
        )
        .await
    }

    pub async fn close_position(&self, terminal_id: &str, position_id: &str) -> CommandResponse {
        self.send_command(
            terminal_id,
            &TerminalCommand::ClosePosition {
                position_id: position_id.to_string(),
            },
        )
        .await
    }

    pub async fn close_all(&self, terminal_id: &str) -> CommandResponse {
        self.send_command(terminal_id, &TerminalCommand::CloseAll).await
    }

    pub async fn pause(&self, terminal_id: &str) -> CommandResponse {
        self.send_command(terminal_id, &TerminalCommand::Pause).await
    }

    pub async fn resume(&self, terminal_id: &str) -> CommandResponse {
        self.send_command(terminal_id, &TerminalCommand::Resume).await
    }

    pub async fn ping(&self, terminal_id: &str) -> CommandResponse {
        self.send_command(terminal_id, &TerminalCommand::Ping).await
    }

    // -- lifecycle ---------------------------------------------------------

    /// Tear one terminal down. Always runs every step: cancel the slave
    /// poll, stop the link, drop it from the map, release its ports, close
    /// its control gate, and invalidate the scan cache. Idempotent.
    pub async fn safe_disconnect(&self, terminal_id: &str) {
        if let Some(handle) = self.slave_polls.lock().unwrap().remove(terminal_id) {
            handle.abort();
        }

        let link = self.links.write().await.remove(terminal_id);
        if let Some(link) = link {
            link.stop();
        }

        self.port_manager.release_by_label(terminal_id).await;
        self.control.close_channel(terminal_id, "disconnected");
        *self.scan_cache.lock().await = None;
        tracing::info!("[{}] Disconnected", terminal_id);
    }

    /// Stop every link, the control gates, and the intake task. Individual
    /// failures never block the rest.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.links.read().await.keys().cloned().collect();
        for terminal_id in &ids {
            self.safe_disconnect(terminal_id).await;
        }
        self.control.shutdown();
        if let Some(handle) = self.intake_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    // -- event intake ------------------------------------------------------

    async fn run_intake(
        reader: Arc<ChannelReader>,
        mut signal_rx: mpsc::UnboundedReceiver<BridgeSignal>,
    ) {
        while let Some(signal) = signal_rx.recv().await {
            match signal {
                BridgeSignal::Error {
                    terminal_id,
                    message,
                } => {
                    let _ = reader.events_tx.send(ReaderEvent::Error {
                        terminal_id,
                        message,
                    });
                }
                BridgeSignal::Event { terminal_id, event } => {
                    reader.handle_terminal_event(terminal_id, event).await;
                }
            }
        }
    }

    async fn handle_terminal_event(self: &Arc<Self>, terminal_id: String, event: TerminalEvent) {
        self.refresh_cache(&terminal_id).await;

        match event {
            TerminalEvent::Connected(snapshot) => {
                tracing::info!(
                    "[{}] Terminal connected (account {}, {} positions)",
                    terminal_id,
                    snapshot.account_id,
                    snapshot.position_count
                );
                let _ = self.events_tx.send(ReaderEvent::TerminalConnected {
                    terminal_id: terminal_id.clone(),
                    snapshot,
                });
                self.schedule_history_fetch(terminal_id);
            }
            TerminalEvent::Disconnected { reason } => {
                let _ = self.events_tx.send(ReaderEvent::TerminalDisconnected {
                    terminal_id,
                    reason,
                });
            }
            TerminalEvent::Heartbeat(update) => {
                // merged into the cache silently; listeners only get a pulse
                let _ = self.events_tx.send(ReaderEvent::Heartbeat {
                    terminal_id,
                    equity: update.equity,
                    floating_pnl: update.floating_pnl,
                });
            }
            TerminalEvent::AccountUpdate(_) => {
                // cache refresh above is the whole effect
            }
            TerminalEvent::PriceUpdate(_) => {
                // cached silently, never forwarded
            }
            event @ (TerminalEvent::PositionOpened(_)
            | TerminalEvent::PositionClosed(_)
            | TerminalEvent::PositionModified(_)
            | TerminalEvent::PositionReversed(_)
            | TerminalEvent::DealExecuted(_)
            | TerminalEvent::OrderPlaced(_)
            | TerminalEvent::OrderCancelled(_)
            | TerminalEvent::Paused
            | TerminalEvent::Resumed) => {
                let _ = self.events_tx.send(ReaderEvent::Terminal {
                    terminal_id,
                    event,
                });
            }
        }
    }

    /// The owning link's state machine already applied the event; mirror its
    /// snapshot into the shared cache.
    async fn refresh_cache(&self, terminal_id: &str) {
        let link = self.links.read().await.get(terminal_id).cloned();
        if let Some(link) = link {
            if let Some(snapshot) = link.last_snapshot() {
                self.snapshots.write().await.insert(
                    terminal_id.to_string(),
                    CachedSnapshot {
                        snapshot,
                        updated_at: Instant::now(),
                    },
                );
            }
        }
    }

    /// CONNECTED is followed by a deep history fetch so the host can show
    /// account history without a separate request path.
    fn schedule_history_fetch(self: &Arc<Self>, terminal_id: String) {
        let reader = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(HISTORY_DELAY).await;
            let response = reader
                .send_command(&terminal_id, &TerminalCommand::GetHistory { days: HISTORY_DAYS })
                .await;
            if response.success {
                let deals = response
                    .field("deals")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(response.payload.clone()));
                let _ = reader.events_tx.send(ReaderEvent::TradeHistory {
                    terminal_id,
                    deals,
                });
            } else {
                tracing::debug!(
                    "[{}] History fetch failed: {:?}",
                    terminal_id,
                    response.error
                );
            }
        });
    }

    // -- slave polling -----------------------------------------------------

    /// Slaves have no PUB stream; a 5-second STATUS poll keeps them alive and
    /// feeds their snapshots through the same normalization path, which
    /// synthesizes open/close events from the position diff.
    pub(crate) fn spawn_slave_poll(self: &Arc<Self>, terminal_id: &str) {
        let mut polls = self.slave_polls.lock().unwrap();
        if polls.contains_key(terminal_id) {
            return;
        }
        let reader = self.clone();
        let id = terminal_id.to_string();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SLAVE_POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let link = reader.links.read().await.get(&id).cloned();
                let bridge = match link {
                    Some(TerminalLink::Zmq(bridge)) => bridge,
                    _ => break,
                };
                let response = bridge.send_command(&TerminalCommand::Status).await;
                if response.success {
                    bridge.mark_alive();
                    reader.ingest_status_payload(&bridge, &response);
                } else {
                    tracing::debug!("[{}] Slave poll failed: {:?}", id, response.error);
                }
            }
            tracing::debug!("[{}] Slave poll exited", id);
        });
        polls.insert(terminal_id.to_string(), handle);
    }

    /// Feed a STATUS reply through the bridge's snapshot state machine and
    /// forward whatever events it synthesizes.
    pub(crate) fn ingest_status_payload(&self, bridge: &ZmqBridge, response: &CommandResponse) {
        let mut frame = serde_json::Map::new();
        frame.insert(
            "type".to_string(),
            Value::String("SNAPSHOT".to_string()),
        );
        for (key, value) in &response.payload {
            if key == "success" {
                continue;
            }
            frame.insert(key.clone(), value.clone());
        }
        let bytes = match serde_json::to_vec(&Value::Object(frame)) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        let events = bridge.ingest_frame(&bytes);
        self.ingest_status_events(bridge, events);
    }

    /// Push already-normalized events into the intake pipeline.
    pub(crate) fn ingest_status_events(&self, bridge: &ZmqBridge, events: Vec<TerminalEvent>) {
        for event in events {
            let _ = self.signal_tx.send(BridgeSignal::Event {
                terminal_id: bridge.terminal_id().to_string(),
                event,
            });
        }
    }
}
