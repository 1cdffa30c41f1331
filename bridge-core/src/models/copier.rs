// bridge-core/src/models/copier.rs
//
// Copier configuration and bookkeeping types. A group ties one leader account
// to many followers; every follower runs as a reversed hedge of the leader.

use super::TradeSide;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Alias mapping a leader base symbol to the follower broker's name for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SymbolAlias {
    pub master_symbol: String,
    pub slave_symbol: String,
}

/// Per-follower replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowerConfig {
    pub id: String,
    pub account_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_lot_multiplier")]
    pub lot_multiplier: f64,
    /// Reversal is enforced by the engine; the field exists so configs
    /// round-trip, but false is rejected on load.
    #[serde(default = "default_enabled")]
    pub reverse_mode: bool,
    #[serde(default)]
    pub symbol_whitelist: Vec<String>,
    #[serde(default)]
    pub symbol_blacklist: Vec<String>,
    #[serde(default)]
    pub symbol_aliases: Vec<SymbolAlias>,
    #[serde(default)]
    pub symbol_suffix: String,
    #[serde(default)]
    pub magic_number_whitelist: Vec<i64>,
    #[serde(default)]
    pub magic_number_blacklist: Vec<i64>,
}

fn default_enabled() -> bool {
    true
}
fn default_lot_multiplier() -> f64 {
    1.0
}

/// One leader and its followers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopierGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub leader_account_id: String,
    /// Suffix the leader's broker appends to symbols, stripped before mapping
    #[serde(default)]
    pub leader_symbol_suffix: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub followers: Vec<FollowerConfig>,
}

/// Relation between a leader position and the hedge opened for one follower.
/// Keyed by leader ticket; one entry per (leader, follower); created on a
/// successful copy and deleted when the leader position closes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationEntry {
    pub leader_ticket: String,
    pub follower_ticket: String,
    pub follower_id: String,
    pub follower_account_id: String,
    pub group_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,
    pub open_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Open,
    Close,
    Modify,
    Error,
}

/// One copy or close attempt, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub group_id: String,
    pub follower_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub symbol: String,
    pub action: String,
    pub volume: f64,
    pub price: f64,
    /// Milliseconds from leader event to follower acknowledgement
    pub latency: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Rolling per-follower statistics, persisted with a debounced write.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FollowerStats {
    pub trades_total: u64,
    pub trades_today: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub today: Option<NaiveDate>,
    pub avg_latency_ms: f64,
    pub success_count: u64,
    pub failed_copies: u64,
    pub success_rate: f64,
    pub total_profit: f64,
}

impl FollowerStats {
    /// Record a successful copy: trade counters, incremental rolling mean
    /// latency, success rate.
    pub fn record_success(&mut self, latency_ms: u64, today: NaiveDate) {
        self.roll_day(today);
        self.trades_total += 1;
        self.trades_today += 1;
        self.success_count += 1;
        let n = self.success_count as f64;
        self.avg_latency_ms += (latency_ms as f64 - self.avg_latency_ms) / n;
        self.update_rate();
    }

    pub fn record_failure(&mut self) {
        self.failed_copies += 1;
        self.update_rate();
    }

    pub fn credit_profit(&mut self, amount: f64) {
        self.total_profit += amount;
    }

    /// Count a trade observed outside the copy path (offline sync, slave-side
    /// autonomous close).
    pub fn record_external_trade(&mut self, today: NaiveDate) {
        self.roll_day(today);
        self.trades_total += 1;
        self.trades_today += 1;
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if self.today != Some(today) {
            self.today = Some(today);
            self.trades_today = 0;
        }
    }

    fn update_rate(&mut self) {
        let attempts = self.success_count + self.failed_copies;
        self.success_rate = if attempts == 0 {
            0.0
        } else {
            self.success_count as f64 / attempts as f64
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_mean_latency() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let mut stats = FollowerStats::default();
        stats.record_success(100, today);
        stats.record_success(200, today);
        stats.record_success(300, today);
        assert!((stats.avg_latency_ms - 200.0).abs() < 1e-9);
        assert_eq!(stats.trades_total, 3);
        assert_eq!(stats.trades_today, 3);
        assert!((stats.success_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_success_rate_counts_failures() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let mut stats = FollowerStats::default();
        stats.record_success(50, today);
        stats.record_failure();
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.failed_copies, 1);
    }

    #[test]
    fn test_daily_counter_resets_on_new_day() {
        let d1 = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 7, 2).unwrap();
        let mut stats = FollowerStats::default();
        stats.record_success(10, d1);
        stats.record_success(10, d1);
        stats.record_success(10, d2);
        assert_eq!(stats.trades_total, 3);
        assert_eq!(stats.trades_today, 1);
    }

    #[test]
    fn test_follower_config_defaults() {
        let json = r#"{"id":"f1","accountId":"200555"}"#;
        let follower: FollowerConfig = serde_json::from_str(json).unwrap();
        assert!(follower.enabled);
        assert!(follower.reverse_mode);
        assert_eq!(follower.lot_multiplier, 1.0);
        assert!(follower.symbol_whitelist.is_empty());
        assert!(follower.symbol_suffix.is_empty());
    }

    #[test]
    fn test_activity_type_tag_name() {
        let entry = ActivityEntry {
            id: "a1".to_string(),
            group_id: "g1".to_string(),
            follower_id: "f1".to_string(),
            timestamp: Utc::now(),
            activity_type: ActivityType::Open,
            symbol: "EURUSD.m".to_string(),
            action: "SELL 2".to_string(),
            volume: 2.0,
            price: 1.1,
            latency: 42,
            status: "success".to_string(),
            error_message: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"open\""));
        assert!(!json.contains("errorMessage"));
    }
}
