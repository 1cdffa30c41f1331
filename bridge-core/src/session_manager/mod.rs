// bridge-core/src/session_manager/mod.rs
//
// Maps terminal ids to account sessions and owns their projections. Sessions
// hold credentials that never cross the UI boundary; only the sanitized view
// leaves this module. Persisted sessions carry the non-sensitive subset so
// login-based matching works across restarts.

use crate::models::{
    ConnectionSession, Credentials, PersistedSession, Platform, SanitizedSession, SessionRole,
    SessionStatus,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;


const SESSIONS_FILE: &str = "sessions.json";

pub struct SessionManager {
    sessions: RwLock<HashMap<String, ConnectionSession>>,
    persist_path: PathBuf,
    save_pending: AtomicBool,
    save_debounce: Duration,
}

impl SessionManager {
    pub fn new(data_dir: &std::path::Path, save_debounce: Duration) -> Arc<Self> {
        let persist_path = data_dir.join(SESSIONS_FILE);
        let sessions = Self::load_persisted(&persist_path);
        Arc::new(Self {
            sessions: RwLock::new(sessions),
            persist_path,
            save_pending: AtomicBool::new(false),
            save_debounce,
        })
    }

    /// Restore persisted sessions as disconnected entries so auto-reconnect
    /// can match them against live snapshots.
    fn load_persisted(path: &std::path::Path) -> HashMap<String, ConnectionSession> {
        let mut sessions = HashMap::new();
        let persisted: Vec<PersistedSession> = match crate::persistence::load_json(path) {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return sessions,
            Err(e) => {
                tracing::warn!("Failed to load persisted sessions: {}", e);
                return sessions;
            }
        };
        for entry in persisted {
            let id = entry.account_id.clone();
            sessions.insert(
                id.clone(),
                ConnectionSession {
                    id,
                    account_id: entry.account_id,
                    platform: entry.platform,
                    role: entry.role,
                    status: SessionStatus::Disconnected,
                    last_update: Utc::now(),
                    last_connected: entry.last_connected,
                    auto_reconnect: true,
                    error: None,
                    terminal_id: None,
                    credentials: entry.login.map(|login| Credentials {
                        mt5_login: login,
                        password: None,
                        broker: None,
                        server: entry.server,
                    }),
                },
            );
        }
        if !sessions.is_empty() {
            tracing::info!("Restored {} persisted session(s)", sessions.len());
        }
        sessions
    }

    /// Register a session in `connecting` state. An auto-discovered session
    /// holding the same login is removed in favor of this one.
    pub async fn connect(
        self: &Arc<Self>,
        id: &str,
        account_id: &str,
        platform: Platform,
        role: SessionRole,
        credentials: Option<Credentials>,
        auto_reconnect: bool,
        terminal_id: Option<String>,
    ) -> SanitizedSession {
        let mut sessions = self.sessions.write().await;

        if let Some(ref creds) = credentials {
            let duplicate: Option<String> = sessions
                .iter()
                .find(|(key, session)| {
                    *key != id
                        && session
                            .credentials
                            .as_ref()
                            .map(|c| c.mt5_login == creds.mt5_login)
                            .unwrap_or(false)
                })
                .map(|(key, _)| key.clone());
            if let Some(duplicate) = duplicate {
                tracing::info!(
                    "Removing duplicate session {} for login {}",
                    duplicate,
                    creds.mt5_login
                );
                sessions.remove(&duplicate);
            }
        }

        let session = ConnectionSession {
            id: id.to_string(),
            account_id: account_id.to_string(),
            platform,
            role,
            status: SessionStatus::Connecting,
            last_update: Utc::now(),
            last_connected: None,
            auto_reconnect,
            error: None,
            terminal_id,
            credentials,
        };
        let sanitized = session.sanitized();
        sessions.insert(id.to_string(), session);
        drop(sessions);
        self.schedule_save();
        sanitized
    }

    /// First successful metric exchange: `connecting` (or a reconnect match
    /// from `disconnected`) becomes `connected`.
    pub async fn mark_connected(self: &Arc<Self>, id: &str, terminal_id: Option<String>) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        match session.status {
            SessionStatus::Connecting | SessionStatus::Disconnected | SessionStatus::Error => {
                session.status = SessionStatus::Connected;
                session.last_update = Utc::now();
                session.last_connected = Some(Utc::now());
                session.error = None;
                if terminal_id.is_some() {
                    session.terminal_id = terminal_id;
                }
                drop(sessions);
                self.schedule_save();
                true
            }
            SessionStatus::Connected => true,
        }
    }

    /// Transport loss. Credentials survive iff auto_reconnect is set, so a
    /// later login match can restore the session without re-entry.
    pub async fn mark_disconnected(self: &Arc<Self>, id: &str, reason: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.status = SessionStatus::Disconnected;
            session.last_update = Utc::now();
            session.error = Some(reason.to_string());
            if !session.auto_reconnect {
                session.credentials = None;
            }
        }
        drop(sessions);
        self.schedule_save();
    }

    pub async fn mark_error(self: &Arc<Self>, id: &str, error: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.status = SessionStatus::Error;
            session.last_update = Utc::now();
            session.error = Some(error.to_string());
        }
        drop(sessions);
        self.schedule_save();
    }

    /// Remove the session outright; no auto-reconnect retry.
    pub async fn archive_disconnect(self: &Arc<Self>, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            self.schedule_save();
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<SanitizedSession> {
        self.sessions.read().await.get(id).map(|s| s.sanitized())
    }

    pub async fn terminal_of(&self, id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(id)
            .and_then(|s| s.terminal_id.clone())
    }

    pub async fn sanitized_sessions(&self) -> Vec<SanitizedSession> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.sanitized())
            .collect()
    }

    /// Ids of sessions in a given status (health check + reconnect sweep).
    pub async fn ids_with_status(&self, status: SessionStatus) -> Vec<String> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The session whose stored login matches, if any.
    pub async fn find_by_login(&self, login: &str) -> Option<SanitizedSession> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| {
                s.credentials
                    .as_ref()
                    .map(|c| c.mt5_login == login)
                    .unwrap_or(false)
            })
            .map(|s| s.sanitized())
    }

    pub async fn has_session(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Write the non-sensitive subset immediately. Failures are logged and
    /// never affect in-memory state.
    pub async fn flush(&self) {
        let persisted: Vec<PersistedSession> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.persisted())
            .collect();
        if let Err(e) = crate::persistence::write_json(&self.persist_path, &persisted) {
            tracing::warn!("Failed to persist sessions: {}", e);
        }
    }

    fn schedule_save(self: &Arc<Self>) {
        if self.save_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(manager.save_debounce).await;
            manager.save_pending.store(false, Ordering::SeqCst);
            manager.flush().await;
        });
    }
}
