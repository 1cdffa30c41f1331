// bridge-core/src/daily_limit.rs
//
// Per-account day-start balance tracking keyed by the broker server day.
// The broker date comes from the terminal's server clock, not the desktop
// clock, so drawdown limits reset exactly when the broker's books do. A day
// crossover with open positions pins the reference to max(equity, balance)
// at the moment of crossover, which is what prop-firm daily rules measure
// against.

use crate::models::AccountSnapshot;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const STATES_FILE: &str = "daily-limit-states.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyAccountState {
    pub account_id: String,
    pub day_start_balance: f64,
    pub day_start_equity: f64,
    pub day_start_date: NaiveDate,
    pub last_eod_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crossover_high_water_mark: Option<f64>,
    #[serde(default)]
    pub had_position_at_crossover: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyLimitResult {
    pub reference_balance: f64,
    pub daily_limit_pnl: f64,
    pub current_day_pnl: f64,
    pub remaining_daily_drawdown: f64,
    pub is_limit_breached: bool,
    pub trading_date: NaiveDate,
}

pub struct DailyLimitTracker {
    states: RwLock<HashMap<String, DailyAccountState>>,
    persist_path: PathBuf,
    save_pending: AtomicBool,
    save_debounce: Duration,
}

impl DailyLimitTracker {
    pub fn new(data_dir: &std::path::Path, save_debounce: Duration) -> Arc<Self> {
        let persist_path = data_dir.join(STATES_FILE);
        let states: Vec<DailyAccountState> = crate::persistence::load_json(&persist_path)
            .unwrap_or_default()
            .unwrap_or_default();
        Arc::new(Self {
            states: RwLock::new(
                states
                    .into_iter()
                    .map(|s| (s.account_id.clone(), s))
                    .collect(),
            ),
            persist_path,
            save_pending: AtomicBool::new(false),
            save_debounce,
        })
    }

    /// Fold fresh metrics into the day-start state, rolling the day over when
    /// the broker date changes.
    pub async fn update_metrics(self: &Arc<Self>, account_id: &str, metrics: &AccountSnapshot) {
        let broker_date = broker_date(metrics);
        let mut states = self.states.write().await;

        match states.get_mut(account_id) {
            None => {
                states.insert(
                    account_id.to_string(),
                    DailyAccountState {
                        account_id: account_id.to_string(),
                        day_start_balance: metrics.balance,
                        day_start_equity: metrics.equity,
                        day_start_date: broker_date,
                        last_eod_timestamp: Utc::now(),
                        crossover_high_water_mark: None,
                        had_position_at_crossover: false,
                    },
                );
                tracing::info!(
                    "Daily tracking seeded for {} (balance {:.2}, date {})",
                    account_id,
                    metrics.balance,
                    broker_date
                );
            }
            Some(state) if state.day_start_date != broker_date => {
                // Day crossover. With positions still open the balance alone
                // understates the account; pin the high-water mark instead.
                let has_open_positions = !metrics.positions.is_empty();
                if has_open_positions {
                    let mark = metrics.equity.max(metrics.balance);
                    state.day_start_balance = mark;
                    state.crossover_high_water_mark = Some(mark);
                    state.had_position_at_crossover = true;
                    tracing::info!(
                        "Day crossover for {} with open positions: reference pinned at {:.2}",
                        account_id,
                        mark
                    );
                } else {
                    state.day_start_balance = metrics.balance;
                    state.crossover_high_water_mark = None;
                    state.had_position_at_crossover = false;
                }
                state.day_start_equity = metrics.equity;
                state.day_start_date = broker_date;
                state.last_eod_timestamp = Utc::now();
            }
            Some(_) => {}
        }
        drop(states);
        self.schedule_save();
    }

    /// Daily drawdown versus the day-start reference. `max_loss_pct` is the
    /// allowed loss as a percentage of the reference balance.
    pub async fn calculate_daily_limit(
        &self,
        account_id: &str,
        max_loss_pct: f64,
        metrics: &AccountSnapshot,
    ) -> Option<DailyLimitResult> {
        let states = self.states.read().await;
        let state = states.get(account_id)?;

        let reference_balance = state
            .crossover_high_water_mark
            .unwrap_or(state.day_start_balance);
        let daily_limit_pnl = -(max_loss_pct / 100.0) * reference_balance;
        let current_day_pnl = metrics.equity - reference_balance;
        let remaining_daily_drawdown = current_day_pnl - daily_limit_pnl;

        Some(DailyLimitResult {
            reference_balance,
            daily_limit_pnl,
            current_day_pnl,
            remaining_daily_drawdown,
            is_limit_breached: current_day_pnl <= daily_limit_pnl,
            trading_date: state.day_start_date,
        })
    }

    pub async fn state_of(&self, account_id: &str) -> Option<DailyAccountState> {
        self.states.read().await.get(account_id).cloned()
    }

    pub async fn flush(&self) {
        let states: Vec<DailyAccountState> =
            self.states.read().await.values().cloned().collect();
        if let Err(e) = crate::persistence::write_json(&self.persist_path, &states) {
            tracing::warn!("Failed to persist daily limit states: {}", e);
        }
    }

    fn schedule_save(self: &Arc<Self>) {
        if self.save_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.save_debounce).await;
            tracker.save_pending.store(false, Ordering::SeqCst);
            tracker.flush().await;
        });
    }
}

/// The broker's calendar day: unix server time when available, the textual
/// `YYYY.MM.DD hh:mm:ss` server clock otherwise, the local date as a last
/// resort.
fn broker_date(metrics: &AccountSnapshot) -> NaiveDate {
    if let Some(unix) = metrics.server_time_unix {
        if let Some(stamp) = DateTime::<Utc>::from_timestamp(unix, 0) {
            return stamp.date_naive();
        }
    }
    if let Some(ref text) = metrics.server_time {
        if text.len() >= 10 {
            let date = text[..10].replace('.', "-");
            if let Ok(parsed) = NaiveDate::parse_from_str(&date, "%Y-%m-%d") {
                return parsed;
            }
        }
    }
    chrono::Local::now().date_naive()
}
