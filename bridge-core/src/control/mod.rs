// bridge-core/src/control/mod.rs
//
// Liveness gate: one PAIR socket bound per terminal. The terminal-side agent
// connects its own PAIR end and treats OS-level socket teardown as the "app
// is gone" signal, so no polling is involved. An ENABLE frame is sent on bind
// and re-sent periodically to cover first-connect races; DISABLE is sent
// best-effort on close.

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Pending,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Agent acknowledged the ENABLE frame
    Connected { terminal_id: String },
    /// PAIR receive loop died; the agent will see the teardown
    Disconnected { terminal_id: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnableFrame<'a> {
    action: &'static str,
    session_id: &'a str,
    issued_at: String,
    license_hint: &'a str,
    app_version: &'a str,
    terminal_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DisableFrame<'a> {
    action: &'static str,
    reason: &'a str,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    action: Option<String>,
}

struct ControlChannel {
    port: u16,
    shutdown: Arc<AtomicBool>,
    status: Arc<Mutex<ChannelStatus>>,
    /// Reason handed to the DISABLE frame when the loop winds down
    close_reason: Arc<Mutex<String>>,
}

pub struct ControlServer {
    channels: Mutex<HashMap<String, ControlChannel>>,
    events_tx: broadcast::Sender<ControlEvent>,
    session_id: String,
    license_hint: String,
    app_version: String,
    resend_interval: Duration,
}

impl ControlServer {
    pub fn new(license_hint: &str, app_version: &str, resend_interval: Duration) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            channels: Mutex::new(HashMap::new()),
            events_tx,
            session_id: uuid::Uuid::new_v4().to_string(),
            license_hint: license_hint.to_string(),
            app_version: app_version.to_string(),
            resend_interval,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events_tx.subscribe()
    }

    pub fn status(&self, terminal_id: &str) -> Option<ChannelStatus> {
        self.channels
            .lock()
            .unwrap()
            .get(terminal_id)
            .map(|c| *c.status.lock().unwrap())
    }

    /// Bind the PAIR gate for one terminal. A bind failure marks the channel
    /// `error` and is not retried: a collision means another instance owns
    /// the port.
    pub fn open_channel(&self, terminal_id: &str, port: u16) -> Result<()> {
        let mut channels = self.channels.lock().unwrap();
        if channels.contains_key(terminal_id) {
            return Ok(());
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(ChannelStatus::Pending));
        let close_reason = Arc::new(Mutex::new("shutdown".to_string()));
        let channel = ControlChannel {
            port,
            shutdown: shutdown.clone(),
            status: status.clone(),
            close_reason: close_reason.clone(),
        };

        let enable = serde_json::to_string(&EnableFrame {
            action: "ENABLE",
            session_id: &self.session_id,
            issued_at: chrono::Utc::now().to_rfc3339(),
            license_hint: &self.license_hint,
            app_version: &self.app_version,
            terminal_id,
        })
        .context("Failed to serialize ENABLE frame")?;

        let terminal = terminal_id.to_string();
        let events_tx = self.events_tx.clone();
        let resend_interval = self.resend_interval;

        tokio::task::spawn_blocking(move || {
            let ctx = zmq::Context::new();
            let socket = match ctx.socket(zmq::PAIR).and_then(|socket| {
                socket.set_linger(0)?;
                socket.set_rcvtimeo(100)?;
                socket.bind(&format!("tcp://127.0.0.1:{}", port))?;
                Ok(socket)
            }) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::error!(
                        "[{}] Control gate bind failed on port {}: {}",
                        terminal,
                        port,
                        e
                    );
                    *status.lock().unwrap() = ChannelStatus::Error;
                    return;
                }
            };

            tracing::info!("[{}] Control gate bound on port {}", terminal, port);
            if let Err(e) = socket.send(enable.as_bytes(), 0) {
                tracing::warn!("[{}] Failed to send ENABLE: {}", terminal, e);
            }
            let mut last_enable = Instant::now();

            loop {
                if shutdown.load(Ordering::SeqCst) {
                    let disable = serde_json::to_string(&DisableFrame {
                        action: "DISABLE",
                        reason: &close_reason.lock().unwrap().clone(),
                    })
                    .unwrap_or_default();
                    let _ = socket.send(disable.as_bytes(), zmq::DONTWAIT);
                    drop(socket);
                    tracing::debug!("[{}] Control gate closed", terminal);
                    return;
                }

                // Safety net for first-connect races
                if last_enable.elapsed() >= resend_interval {
                    if let Err(e) = socket.send(enable.as_bytes(), zmq::DONTWAIT) {
                        tracing::debug!("[{}] ENABLE re-send failed: {}", terminal, e);
                    }
                    last_enable = Instant::now();
                }

                match socket.recv_bytes(0) {
                    Ok(frame) => {
                        let inbound: InboundFrame = match serde_json::from_slice(&frame) {
                            Ok(inbound) => inbound,
                            // Non-JSON inbound traffic is ignored
                            Err(_) => continue,
                        };
                        match inbound.action.as_deref() {
                            Some("ACK") | Some("CONNECTED") => {
                                let mut current = status.lock().unwrap();
                                if *current != ChannelStatus::Connected {
                                    tracing::info!("[{}] Control gate acknowledged", terminal);
                                    *current = ChannelStatus::Connected;
                                    let _ = events_tx.send(ControlEvent::Connected {
                                        terminal_id: terminal.clone(),
                                    });
                                }
                            }
                            Some("HEARTBEAT_ACK") => {}
                            _ => {}
                        }
                    }
                    Err(zmq::Error::EAGAIN) => continue,
                    Err(e) => {
                        tracing::warn!("[{}] Control gate receive error: {}", terminal, e);
                        *status.lock().unwrap() = ChannelStatus::Error;
                        let _ = events_tx.send(ControlEvent::Disconnected {
                            terminal_id: terminal.clone(),
                        });
                        return;
                    }
                }
            }
        });

        channels.insert(terminal_id.to_string(), channel);
        Ok(())
    }

    /// Best-effort DISABLE, then tear the channel down.
    pub fn close_channel(&self, terminal_id: &str, reason: &str) {
        let channel = self.channels.lock().unwrap().remove(terminal_id);
        if let Some(channel) = channel {
            *channel.close_reason.lock().unwrap() = reason.to_string();
            channel.shutdown.store(true, Ordering::SeqCst);
            tracing::info!(
                "[{}] Control gate on port {} closing ({})",
                terminal_id,
                channel.port,
                reason
            );
        }
    }

    pub fn shutdown(&self) {
        let ids: Vec<String> = self.channels.lock().unwrap().keys().cloned().collect();
        for terminal_id in ids {
            self.close_channel(&terminal_id, "shutdown");
        }
    }
}
