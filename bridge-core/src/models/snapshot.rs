use super::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal platform family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "MT")]
    Mt,
    #[serde(rename = "CT")]
    Ct,
}

impl Default for Platform {
    fn default() -> Self {
        Platform::Mt
    }
}

/// Cached view of one terminal's account state and open positions
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub broker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub equity: f64,
    #[serde(default)]
    pub margin: f64,
    #[serde(default)]
    pub free_margin: f64,
    /// Null iff margin is zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_level: Option<f64>,
    #[serde(default)]
    #[serde(rename = "floatingPnL")]
    pub floating_pnl: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub leverage: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default = "default_true")]
    pub is_license_valid: bool,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub position_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time_unix: Option<i64>,
    /// Peer emits discrete open/close events; snapshot diffing is skipped
    #[serde(default)]
    pub event_driven: bool,
}

fn default_true() -> bool {
    true
}

impl AccountSnapshot {
    /// Re-derive the fields other components rely on:
    /// `position_count == |positions|` and `margin_level` null iff margin is 0.
    pub fn recompute_derived(&mut self) {
        self.position_count = self.positions.len();
        self.margin_level = if self.margin > 0.0 {
            Some(self.equity / self.margin * 100.0)
        } else {
            None
        };
    }

    /// Merge a heartbeat into this snapshot without replacing its identity.
    pub fn merge_heartbeat(&mut self, hb: &HeartbeatUpdate) {
        if let Some(balance) = hb.balance {
            self.balance = balance;
        }
        if let Some(equity) = hb.equity {
            self.equity = equity;
        }
        if let Some(pnl) = hb.floating_pnl {
            self.floating_pnl = pnl;
        }
        if let Some(margin) = hb.margin {
            self.margin = margin;
        }
        if let Some(free) = hb.free_margin {
            self.free_margin = free;
        }
        if let Some(valid) = hb.is_license_valid {
            self.is_license_valid = valid;
        }
        if let Some(paused) = hb.is_paused {
            self.is_paused = paused;
        }
        if let Some(ref positions) = hb.positions {
            self.positions = positions.clone();
        }
        if hb.server_time.is_some() {
            self.server_time = hb.server_time.clone();
        }
        if hb.server_time_unix.is_some() {
            self.server_time_unix = hb.server_time_unix;
        }
        if hb.timestamp.is_some() {
            self.timestamp = hb.timestamp;
        }
        self.recompute_derived();
    }

    pub fn find_position(&self, id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }
}

/// Partial account update carried by HEARTBEAT frames
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatUpdate {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub balance: Option<f64>,
    #[serde(default)]
    pub equity: Option<f64>,
    #[serde(default)]
    pub margin: Option<f64>,
    #[serde(default)]
    pub free_margin: Option<f64>,
    #[serde(default)]
    #[serde(rename = "floatingPnL")]
    pub floating_pnl: Option<f64>,
    #[serde(default)]
    pub is_license_valid: Option<bool>,
    #[serde(default)]
    pub is_paused: Option<bool>,
    #[serde(default)]
    pub positions: Option<Vec<Position>>,
    #[serde(default)]
    pub server_time: Option<String>,
    #[serde(default)]
    pub server_time_unix: Option<i64>,
}
