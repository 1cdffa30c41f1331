// bridge-core/src/host/mod.rs
//
// Host-shell glue, specified at the interface level: a UiSink the embedding
// shell implements, plus the periodic tasks that feed it. The shell owns
// windows and IPC; this module only decides what gets pushed and when.
// Heartbeat-driven pushes are throttled; trade and connection changes go out
// immediately.

use crate::channel_reader::{ChannelReader, ReaderEvent};
use crate::copier::{CopierEngine, CopierEvent};
use crate::daily_limit::DailyLimitTracker;
use crate::models::{
    AccountSnapshot, Credentials, EventKind, Platform, SanitizedSession, SessionRole,
    SessionStatus,
};
use crate::session_manager::SessionManager;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;


const ACCOUNT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_PUSH_THROTTLE: Duration = Duration::from_secs(2);
/// A snapshot older than this is not trusted for auto-reconnect matching.
const RECONNECT_SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum UiEvent {
    /// Periodic full refresh of every cached account snapshot
    Accounts(Vec<AccountSnapshot>),
    SessionChanged(SanitizedSession),
    TerminalConnected {
        terminal_id: String,
    },
    TerminalDisconnected {
        terminal_id: String,
        reason: Option<String>,
    },
    Trade {
        terminal_id: String,
        kind: EventKind,
    },
    Heartbeat {
        terminal_id: String,
        equity: Option<f64>,
    },
    CopyAlert {
        group_id: String,
        follower_id: String,
        message: String,
    },
}

/// The host shell's UI push channel.
#[async_trait]
pub trait UiSink: Send + Sync {
    async fn push(&self, event: UiEvent);
}

/// A UiSink that just logs; used by the headless runner.
pub struct LogSink;

#[async_trait]
impl UiSink for LogSink {
    async fn push(&self, event: UiEvent) {
        match event {
            UiEvent::Accounts(accounts) => {
                tracing::debug!("UI push: {} account snapshot(s)", accounts.len());
            }
            other => tracing::debug!("UI push: {:?}", other),
        }
    }
}

pub struct HostGlue {
    handles: Vec<JoinHandle<()>>,
}

impl HostGlue {
    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for HostGlue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the three host timers and the event pump.
pub fn spawn_host_tasks(
    reader: Arc<ChannelReader>,
    sessions: Arc<SessionManager>,
    copier: Arc<CopierEngine>,
    daily: Arc<DailyLimitTracker>,
    sink: Arc<dyn UiSink>,
) -> HostGlue {
    let mut handles = Vec::new();
    handles.push(spawn_account_refresh(reader.clone(), sink.clone()));
    handles.push(spawn_health_check(
        reader.clone(),
        sessions.clone(),
        sink.clone(),
    ));
    handles.push(spawn_discovery(reader.clone(), sessions, sink.clone()));
    handles.push(spawn_event_pump(reader, copier, daily, sink));
    HostGlue { handles }
}

/// Every 30 s: publish the cached snapshots.
fn spawn_account_refresh(reader: Arc<ChannelReader>, sink: Arc<dyn UiSink>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ACCOUNT_REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            let mut accounts = Vec::new();
            for terminal_id in reader.connected_terminals().await {
                if let Some(snapshot) = reader.get_last_snapshot(&terminal_id).await {
                    accounts.push(snapshot);
                }
            }
            if !accounts.is_empty() {
                sink.push(UiEvent::Accounts(accounts)).await;
            }
        }
    })
}

/// Every 5 s: mark connected sessions whose bridge is dead or stale as
/// disconnected.
fn spawn_health_check(
    reader: Arc<ChannelReader>,
    sessions: Arc<SessionManager>,
    sink: Arc<dyn UiSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            interval.tick().await;
            for session_id in sessions.ids_with_status(SessionStatus::Connected).await {
                let terminal = sessions.terminal_of(&session_id).await;
                let alive = match terminal {
                    Some(ref terminal) => reader.is_terminal_alive(terminal).await,
                    None => false,
                };
                if !alive {
                    tracing::warn!("Session {} lost its terminal, marking disconnected", session_id);
                    sessions
                        .mark_disconnected(&session_id, "terminal heartbeat lost")
                        .await;
                    if let Some(session) = sessions.get(&session_id).await {
                        sink.push(UiEvent::SessionChanged(session)).await;
                    }
                }
            }
        }
    })
}

/// Every 30 s: rescan, auto-create sessions for new terminals, and reconnect
/// disconnected sessions whose login matches a fresh snapshot.
fn spawn_discovery(
    reader: Arc<ChannelReader>,
    sessions: Arc<SessionManager>,
    sink: Arc<dyn UiSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DISCOVERY_INTERVAL);
        loop {
            interval.tick().await;
            let connected = reader.scan_and_connect(false).await;

            for terminal_id in connected {
                let snapshot = match reader.get_last_snapshot(&terminal_id).await {
                    Some(snapshot) if !snapshot.account_id.is_empty() => snapshot,
                    _ => continue,
                };

                if sessions.has_session(&terminal_id).await
                    || sessions.find_by_login(&terminal_id).await.is_some()
                {
                    // existing session: handle a possible auto-reconnect
                    let matched = sessions.find_by_login(&terminal_id).await;
                    if let Some(session) = matched {
                        if session.status == SessionStatus::Disconnected {
                            let fresh = reader
                                .snapshot_age(&terminal_id)
                                .await
                                .map(|age| age < RECONNECT_SNAPSHOT_MAX_AGE)
                                .unwrap_or(false);
                            if fresh
                                && sessions
                                    .mark_connected(&session.id, Some(terminal_id.clone()))
                                    .await
                            {
                                tracing::info!(
                                    "Auto-reconnected session {} via terminal {}",
                                    session.id,
                                    terminal_id
                                );
                                if let Some(updated) = sessions.get(&session.id).await {
                                    sink.push(UiEvent::SessionChanged(updated)).await;
                                }
                            }
                        }
                    }
                    continue;
                }

                // brand-new terminal: auto-create a local session for it
                let created = sessions
                    .connect(
                        &terminal_id,
                        &snapshot.account_id,
                        snapshot.platform,
                        SessionRole::Local,
                        Some(Credentials {
                            mt5_login: terminal_id.clone(),
                            password: None,
                            broker: Some(snapshot.broker.clone()),
                            server: snapshot.server.clone(),
                        }),
                        true,
                        Some(terminal_id.clone()),
                    )
                    .await;
                sessions
                    .mark_connected(&created.id, Some(terminal_id.clone()))
                    .await;
                if let Some(session) = sessions.get(&created.id).await {
                    sink.push(UiEvent::SessionChanged(session)).await;
                }
            }
        }
    })
}

/// Forward reader and copier events to the UI; heartbeats are throttled per
/// terminal, everything else is immediate. Heartbeats also drive the daily
/// limit tracker.
fn spawn_event_pump(
    reader: Arc<ChannelReader>,
    copier: Arc<CopierEngine>,
    daily: Arc<DailyLimitTracker>,
    sink: Arc<dyn UiSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader_events = reader.subscribe();
        let mut copier_events = copier.subscribe();
        let mut last_heartbeat_push: HashMap<String, Instant> = HashMap::new();

        loop {
            tokio::select! {
                event = reader_events.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("UI pump lagged {} reader events", n);
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    };
                    match event {
                        ReaderEvent::TerminalConnected { terminal_id, .. } => {
                            sink.push(UiEvent::TerminalConnected { terminal_id }).await;
                        }
                        ReaderEvent::TerminalDisconnected { terminal_id, reason } => {
                            sink.push(UiEvent::TerminalDisconnected { terminal_id, reason }).await;
                        }
                        ReaderEvent::Heartbeat { terminal_id, equity, .. } => {
                            if let Some(snapshot) = reader.get_last_snapshot(&terminal_id).await {
                                if !snapshot.account_id.is_empty() {
                                    let account_id = snapshot.account_id.clone();
                                    daily.update_metrics(&account_id, &snapshot).await;
                                }
                            }
                            let now = Instant::now();
                            let due = last_heartbeat_push
                                .get(&terminal_id)
                                .map(|at| now.duration_since(*at) >= HEARTBEAT_PUSH_THROTTLE)
                                .unwrap_or(true);
                            if due {
                                last_heartbeat_push.insert(terminal_id.clone(), now);
                                sink.push(UiEvent::Heartbeat { terminal_id, equity }).await;
                            }
                        }
                        ReaderEvent::Terminal { terminal_id, event } => {
                            sink.push(UiEvent::Trade {
                                terminal_id,
                                kind: event.kind(),
                            })
                            .await;
                        }
                        ReaderEvent::TradeHistory { .. } | ReaderEvent::Error { .. } => {}
                    }
                }
                event = copier_events.recv() => {
                    match event {
                        Ok(CopierEvent::CopyError { group_id, follower_id, message, .. }) => {
                            sink.push(UiEvent::CopyAlert { group_id, follower_id, message }).await;
                        }
                        Ok(CopierEvent::Activity(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    })
}
