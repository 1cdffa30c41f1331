use super::Platform;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Local,
    Vps,
    Cloud,
}

impl Default for SessionRole {
    fn default() -> Self {
        SessionRole::Local
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Login material held by a session. Never serialized; a sanitized copy is
/// the only shape that crosses the UI boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub mt5_login: String,
    pub password: Option<String>,
    pub broker: Option<String>,
    pub server: Option<String>,
}

/// One account session as tracked by the SessionManager.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub id: String,
    pub account_id: String,
    pub platform: Platform,
    pub role: SessionRole,
    pub status: SessionStatus,
    pub last_update: DateTime<Utc>,
    pub last_connected: Option<DateTime<Utc>>,
    pub auto_reconnect: bool,
    pub error: Option<String>,
    pub terminal_id: Option<String>,
    pub credentials: Option<Credentials>,
}

impl ConnectionSession {
    /// The UI-safe projection. Exposes login/broker/server only, never the
    /// password or the raw credential struct.
    pub fn sanitized(&self) -> SanitizedSession {
        SanitizedSession {
            id: self.id.clone(),
            account_id: self.account_id.clone(),
            platform: self.platform,
            role: self.role,
            status: self.status,
            last_update: self.last_update,
            last_connected: self.last_connected,
            auto_reconnect: self.auto_reconnect,
            error: self.error.clone(),
            mt5_login: self
                .credentials
                .as_ref()
                .map(|c| c.mt5_login.clone()),
            broker: self.credentials.as_ref().and_then(|c| c.broker.clone()),
            server: self.credentials.as_ref().and_then(|c| c.server.clone()),
        }
    }

    /// Non-sensitive subset persisted to sessions.json.
    pub fn persisted(&self) -> PersistedSession {
        PersistedSession {
            account_id: self.account_id.clone(),
            platform: self.platform,
            role: self.role,
            login: self
                .credentials
                .as_ref()
                .map(|c| c.mt5_login.clone()),
            server: self.credentials.as_ref().and_then(|c| c.server.clone()),
            last_connected: self.last_connected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedSession {
    pub id: String,
    pub account_id: String,
    pub platform: Platform,
    pub role: SessionRole,
    pub status: SessionStatus,
    pub last_update: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    pub auto_reconnect: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mt5_login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub account_id: String,
    pub platform: Platform,
    pub role: SessionRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ConnectionSession {
        ConnectionSession {
            id: "uuid-1".to_string(),
            account_id: "acct-1".to_string(),
            platform: Platform::Mt,
            role: SessionRole::Local,
            status: SessionStatus::Connected,
            last_update: Utc::now(),
            last_connected: Some(Utc::now()),
            auto_reconnect: true,
            error: None,
            terminal_id: Some("100234".to_string()),
            credentials: Some(Credentials {
                mt5_login: "100234".to_string(),
                password: Some("hunter2".to_string()),
                broker: Some("Demo".to_string()),
                server: Some("Demo-01".to_string()),
            }),
        }
    }

    #[test]
    fn test_sanitized_never_carries_password() {
        let s = session().sanitized();
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("password"));
        assert_eq!(s.mt5_login.as_deref(), Some("100234"));
        assert_eq!(s.broker.as_deref(), Some("Demo"));
    }

    #[test]
    fn test_persisted_subset_is_non_sensitive() {
        let p = session().persisted();
        let json = serde_json::to_string(&p).unwrap();
        assert!(!json.contains("hunter2"));
        assert_eq!(p.login.as_deref(), Some("100234"));
        assert_eq!(p.server.as_deref(), Some("Demo-01"));
    }
}
