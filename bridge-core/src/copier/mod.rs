// bridge-core/src/copier/mod.rs
//
// Leader -> follower trade replication. Every follower runs as a reversed
// hedge of its leader: a leader BUY opens a follower SELL and vice versa;
// that reversal is engine policy, not configuration. Copies are filtered per
// follower (magic numbers, symbol mapping), sized by the lot multiplier,
// suppressed by a per-follower circuit breaker, and tracked in a correlation
// multimap keyed by leader ticket so leader closes can unwind the hedges.

mod filters;
mod offline_sync;


pub use filters::{magic_allows, map_symbol};

use crate::channel_reader::{ChannelReader, OpenPositionRequest, ReaderEvent};
use crate::models::{
    ActivityEntry, ActivityType, ClosedPosition, CopierGroup, CorrelationEntry, FollowerConfig,
    FollowerStats, Position, TerminalEvent,
};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;
const COPY_MAGIC: i64 = 123_456;
const ACTIVITY_CAP: usize = 500;

const CORRELATIONS_FILE: &str = "copier-correlations.json";
const ACTIVITY_FILE: &str = "copier-activity.json";
const STATS_FILE: &str = "copier-follower-stats.json";
const WATERMARK_FILE: &str = "copier-offline-watermark.json";

#[derive(Debug, Clone)]
pub enum CopierEvent {
    Activity(ActivityEntry),
    CopyError {
        group_id: String,
        follower_id: String,
        message: String,
        circuit_breaker_active: bool,
    },
}

pub struct CopierEngine {
    reader: Arc<ChannelReader>,
    data_dir: PathBuf,
    /// Directory holding the terminal-side JSONL trade logs (offline sync)
    trade_log_dir: PathBuf,
    save_debounce: Duration,
    global_enabled: AtomicBool,
    groups: RwLock<Vec<CopierGroup>>,
    /// account id -> terminal id, maintained by the host
    account_map: RwLock<HashMap<String, String>>,
    /// leader ticket -> one entry per mirroring follower
    correlations: RwLock<HashMap<String, Vec<CorrelationEntry>>>,
    activity: RwLock<VecDeque<ActivityEntry>>,
    stats: RwLock<HashMap<String, FollowerStats>>,
    /// consecutive-failure counters per follower
    breaker: RwLock<HashMap<String, u32>>,
    /// per-(follower, leader ticket) copy serialization
    copy_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    /// account login -> last processed offline-trade unix timestamp
    watermarks: RwLock<HashMap<String, i64>>,
    save_pending: AtomicBool,
    events_tx: broadcast::Sender<CopierEvent>,
    listen_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl CopierEngine {
    pub fn new(
        reader: Arc<ChannelReader>,
        data_dir: &std::path::Path,
        trade_log_dir: &std::path::Path,
        save_debounce: Duration,
    ) -> Arc<Self> {
        let correlations = crate::persistence::load_json(&data_dir.join(CORRELATIONS_FILE))
            .unwrap_or_default()
            .unwrap_or_default();
        let activity: Vec<ActivityEntry> = crate::persistence::load_json(&data_dir.join(ACTIVITY_FILE))
            .unwrap_or_default()
            .unwrap_or_default();
        let stats = crate::persistence::load_json(&data_dir.join(STATS_FILE))
            .unwrap_or_default()
            .unwrap_or_default();
        let watermarks = crate::persistence::load_json(&data_dir.join(WATERMARK_FILE))
            .unwrap_or_default()
            .unwrap_or_default();

        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            reader,
            data_dir: data_dir.to_path_buf(),
            trade_log_dir: trade_log_dir.to_path_buf(),
            save_debounce,
            global_enabled: AtomicBool::new(true),
            groups: RwLock::new(Vec::new()),
            account_map: RwLock::new(HashMap::new()),
            correlations: RwLock::new(correlations),
            activity: RwLock::new(activity.into_iter().collect()),
            stats: RwLock::new(stats),
            breaker: RwLock::new(HashMap::new()),
            copy_locks: Mutex::new(HashMap::new()),
            watermarks: RwLock::new(watermarks),
            save_pending: AtomicBool::new(false),
            events_tx,
            listen_handle: StdMutex::new(None),
        })
    }

    /// Subscribe to the reader and start replicating.
    pub fn start(self: &Arc<Self>) {
        let mut handle_slot = self.listen_handle.lock().unwrap();
        if handle_slot.is_some() {
            return;
        }
        let engine = self.clone();
        let mut events = self.reader.subscribe();
        *handle_slot = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ReaderEvent::Terminal { terminal_id, event }) => match event {
                        TerminalEvent::PositionOpened(position) => {
                            engine.position_opened(&terminal_id, &position).await;
                        }
                        TerminalEvent::PositionClosed(closed) => {
                            engine.position_closed(&terminal_id, &closed).await;
                        }
                        // SL/TP copying is disabled by contract
                        TerminalEvent::PositionModified(_) => {}
                        _ => {}
                    },
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Copier lagged {} reader events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CopierEvent> {
        self.events_tx.subscribe()
    }

    // -- configuration -----------------------------------------------------

    /// Replace the group configuration. Reverse mode is engine policy: a
    /// follower configured otherwise is corrected, not honored.
    pub async fn update_groups(&self, mut groups: Vec<CopierGroup>) {
        for group in &mut groups {
            for follower in &mut group.followers {
                if !follower.reverse_mode {
                    tracing::warn!(
                        "Follower {} configured with reverseMode=false; reversal is enforced",
                        follower.id
                    );
                    follower.reverse_mode = true;
                }
            }
        }
        *self.groups.write().await = groups;
    }

    pub async fn update_account_map(&self, map: HashMap<String, String>) {
        *self.account_map.write().await = map;
    }

    pub fn set_global_enabled(&self, enabled: bool) {
        self.global_enabled.store(enabled, Ordering::SeqCst);
        tracing::info!("Copier globally {}", if enabled { "enabled" } else { "disabled" });
    }

    pub async fn reset_circuit_breaker(&self, follower_id: &str) {
        self.breaker.write().await.remove(follower_id);
        tracing::info!("Circuit breaker reset for follower {}", follower_id);
    }

    // -- introspection -----------------------------------------------------

    pub async fn get_group_stats(&self) -> HashMap<String, FollowerStats> {
        self.stats.read().await.clone()
    }

    pub async fn get_activity_log(&self) -> Vec<ActivityEntry> {
        self.activity.read().await.iter().cloned().collect()
    }

    pub async fn correlations_for(&self, leader_ticket: &str) -> Vec<CorrelationEntry> {
        self.correlations
            .read()
            .await
            .get(leader_ticket)
            .cloned()
            .unwrap_or_default()
    }

    /// Realised plus floating hedge P/L attributed to each leader account.
    pub async fn get_hedge_pnl_by_leader(&self) -> HashMap<String, f64> {
        let groups = self.groups.read().await;
        let stats = self.stats.read().await;
        let mut totals: HashMap<String, f64> = HashMap::new();

        for group in groups.iter() {
            let mut total = 0.0;
            for follower in &group.followers {
                if let Some(follower_stats) = stats.get(&follower.id) {
                    total += follower_stats.total_profit;
                }
                let follower_terminal = self.terminal_for_account(&follower.account_id).await;
                if let Some(snapshot) = self.reader.get_last_snapshot(&follower_terminal).await {
                    total += snapshot
                        .positions
                        .iter()
                        .map(|p| p.composite_profit())
                        .sum::<f64>();
                }
            }
            *totals.entry(group.leader_account_id.clone()).or_insert(0.0) += total;
        }
        totals
    }

    // -- replication -------------------------------------------------------

    pub async fn position_opened(self: &Arc<Self>, terminal_id: &str, position: &Position) {
        if !self.global_enabled.load(Ordering::SeqCst) {
            return;
        }
        let leader_account = match self.account_for_terminal(terminal_id).await {
            Some(account) => account,
            None => return,
        };

        let groups = self.groups.read().await.clone();
        for group in groups
            .iter()
            .filter(|g| g.enabled && g.leader_account_id == leader_account)
        {
            for follower in group.followers.iter().filter(|f| f.enabled) {
                self.copy_open(group, follower, position).await;
            }
        }
    }

    async fn copy_open(
        self: &Arc<Self>,
        group: &CopierGroup,
        follower: &FollowerConfig,
        position: &Position,
    ) {
        let follower_terminal = self.terminal_for_account(&follower.account_id).await;

        // Followers hosted on slave terminals copy autonomously on the
        // terminal side; driving them from here would double the hedge.
        if self.reader.is_slave_terminal(&follower_terminal).await {
            tracing::debug!(
                "Skipping follower {} on slave terminal {}",
                follower.id,
                follower_terminal
            );
            return;
        }

        if !magic_allows(follower, position.magic) {
            tracing::debug!(
                "Magic {} filtered for follower {}",
                position.magic.unwrap_or(0),
                follower.id
            );
            return;
        }

        let symbol = match map_symbol(&group.leader_symbol_suffix, follower, &position.symbol) {
            Some(symbol) => symbol,
            None => {
                tracing::debug!(
                    "Symbol {} filtered for follower {}",
                    position.symbol,
                    follower.id
                );
                return;
            }
        };

        if self.breaker_tripped(&follower.id).await {
            tracing::debug!("Circuit breaker active, skipping follower {}", follower.id);
            return;
        }

        let volume = position.lots() * follower.lot_multiplier;
        let volume = (volume * 100.0).round() / 100.0;
        if volume <= 0.0 {
            tracing::debug!("Zero volume after sizing, skipping follower {}", follower.id);
            return;
        }

        let side = position.side.opposite();
        let leader_ticket = position.id.clone();

        // Serialize this specific (follower, leader ticket) copy; a racing
        // duplicate event waits here and then sees the correlation.
        let lock = self.copy_lock(&follower.id, &leader_ticket).await;
        let _guard = lock.lock().await;
        if self
            .correlations
            .read()
            .await
            .get(&leader_ticket)
            .map(|entries| entries.iter().any(|e| e.follower_id == follower.id))
            .unwrap_or(false)
        {
            tracing::debug!(
                "Ticket {} already copied to follower {}",
                leader_ticket,
                follower.id
            );
            return;
        }

        let started = Instant::now();
        let response = self
            .reader
            .open_position(
                &follower_terminal,
                OpenPositionRequest {
                    symbol: symbol.clone(),
                    side,
                    volume,
                    sl: Some(0.0),
                    tp: Some(0.0),
                    magic: Some(COPY_MAGIC),
                    comment: Some(format!("HE Copy {}", leader_ticket)),
                    deviation: None,
                },
            )
            .await;
        let latency = started.elapsed().as_millis() as u64;

        if response.success {
            let follower_ticket = response.ticket().unwrap_or_else(|| "unknown".to_string());
            tracing::info!(
                "Copied {} {} {} -> {} {} {} on {} ({} ms)",
                position.side,
                position.lots(),
                position.symbol,
                side,
                volume,
                symbol,
                follower_terminal,
                latency
            );
            self.correlations
                .write()
                .await
                .entry(leader_ticket.clone())
                .or_default()
                .push(CorrelationEntry {
                    leader_ticket: leader_ticket.clone(),
                    follower_ticket,
                    follower_id: follower.id.clone(),
                    follower_account_id: follower.account_id.clone(),
                    group_id: group.id.clone(),
                    symbol: symbol.clone(),
                    side,
                    volume,
                    open_time: Utc::now(),
                });
            self.breaker.write().await.remove(&follower.id);
            self.stats
                .write()
                .await
                .entry(follower.id.clone())
                .or_default()
                .record_success(latency, Utc::now().date_naive());
            self.push_activity(
                group,
                follower,
                ActivityType::Open,
                &symbol,
                &format!("{} {:.2}", side, volume),
                volume,
                position.entry_price,
                latency,
                "success",
                None,
            )
            .await;
            self.schedule_save();
        } else {
            let message = response
                .error
                .unwrap_or_else(|| "unknown copy error".to_string());
            tracing::warn!(
                "Copy to follower {} failed: {} (ticket {})",
                follower.id,
                message,
                leader_ticket
            );
            self.stats
                .write()
                .await
                .entry(follower.id.clone())
                .or_default()
                .record_failure();
            let failures = {
                let mut breaker = self.breaker.write().await;
                let counter = breaker.entry(follower.id.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            self.push_activity(
                group,
                follower,
                ActivityType::Error,
                &symbol,
                &format!("{} {:.2}", side, volume),
                volume,
                position.entry_price,
                latency,
                "failed",
                Some(message.clone()),
            )
            .await;
            if failures >= CIRCUIT_BREAKER_THRESHOLD {
                tracing::error!(
                    "Circuit breaker tripped for follower {} after {} failures",
                    follower.id,
                    failures
                );
                let _ = self.events_tx.send(CopierEvent::CopyError {
                    group_id: group.id.clone(),
                    follower_id: follower.id.clone(),
                    message,
                    circuit_breaker_active: true,
                });
            }
            self.schedule_save();
        }
    }

    pub async fn position_closed(self: &Arc<Self>, terminal_id: &str, closed: &ClosedPosition) {
        // Autonomous slave-side close: credit the realised result to the
        // follower that owns this terminal.
        if closed.is_deal_out() {
            if let Some(account) = self.account_for_terminal(terminal_id).await {
                if let Some((group, follower)) = self.follower_by_account(&account).await {
                    let profit = closed.realized_profit();
                    {
                        let mut stats = self.stats.write().await;
                        let entry = stats.entry(follower.id.clone()).or_default();
                        entry.credit_profit(profit);
                        entry.record_external_trade(Utc::now().date_naive());
                    }
                    self.push_activity(
                        &group,
                        &follower,
                        ActivityType::Close,
                        &closed.position.symbol,
                        "slave close",
                        closed.position.lots(),
                        closed.position.current_price,
                        0,
                        "success",
                        None,
                    )
                    .await;
                    self.schedule_save();
                }
            }
        }

        // Leader close: unwind every correlated hedge.
        let entries = self
            .correlations
            .write()
            .await
            .remove(&closed.position.id)
            .unwrap_or_default();
        if entries.is_empty() {
            return;
        }

        let groups = self.groups.read().await.clone();
        for entry in entries {
            let follower_terminal = self.terminal_for_account(&entry.follower_account_id).await;

            // Read the follower's realised result from its cached snapshot
            // before the close removes the position.
            let follower_profit = self
                .reader
                .get_last_snapshot(&follower_terminal)
                .await
                .and_then(|snapshot| {
                    snapshot
                        .find_position(&entry.follower_ticket)
                        .map(|p| p.composite_profit())
                });

            let started = Instant::now();
            let response = self
                .reader
                .close_position(&follower_terminal, &entry.follower_ticket)
                .await;
            let latency = started.elapsed().as_millis() as u64;

            let group = groups.iter().find(|g| g.id == entry.group_id);
            let follower = group
                .and_then(|g| g.followers.iter().find(|f| f.id == entry.follower_id))
                .cloned();

            if response.success {
                if let Some(profit) = follower_profit {
                    self.stats
                        .write()
                        .await
                        .entry(entry.follower_id.clone())
                        .or_default()
                        .credit_profit(profit);
                }
                tracing::info!(
                    "Closed hedge {} on {} for leader ticket {} (P/L {:?})",
                    entry.follower_ticket,
                    follower_terminal,
                    entry.leader_ticket,
                    follower_profit
                );
            } else {
                tracing::warn!(
                    "Failed to close hedge {} on {}: {:?}",
                    entry.follower_ticket,
                    follower_terminal,
                    response.error
                );
            }

            if let (Some(group), Some(follower)) = (group, follower) {
                self.push_activity(
                    group,
                    &follower,
                    if response.success {
                        ActivityType::Close
                    } else {
                        ActivityType::Error
                    },
                    &entry.symbol,
                    &format!("close {}", entry.follower_ticket),
                    entry.volume,
                    0.0,
                    latency,
                    if response.success { "success" } else { "failed" },
                    response.error.clone(),
                )
                .await;
            }
        }

        // The ticket is done; its copy locks have nothing left to guard.
        self.copy_locks
            .lock()
            .await
            .retain(|(_, ticket), _| ticket != &closed.position.id);

        // Correlation churn on a leader close is flushed immediately.
        self.flush().await;
    }

    // -- helpers -----------------------------------------------------------

    async fn breaker_tripped(&self, follower_id: &str) -> bool {
        self.breaker
            .read()
            .await
            .get(follower_id)
            .map(|&count| count >= CIRCUIT_BREAKER_THRESHOLD)
            .unwrap_or(false)
    }

    async fn copy_lock(&self, follower_id: &str, leader_ticket: &str) -> Arc<Mutex<()>> {
        self.copy_locks
            .lock()
            .await
            .entry((follower_id.to_string(), leader_ticket.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Terminal id serving an account: the explicit map wins, otherwise the
    /// account id doubles as the terminal id (the default for discovered
    /// terminals keyed by login).
    async fn terminal_for_account(&self, account_id: &str) -> String {
        self.account_map
            .read()
            .await
            .get(account_id)
            .cloned()
            .unwrap_or_else(|| account_id.to_string())
    }

    async fn account_for_terminal(&self, terminal_id: &str) -> Option<String> {
        let map = self.account_map.read().await;
        if let Some((account, _)) = map.iter().find(|(_, t)| t.as_str() == terminal_id) {
            return Some(account.clone());
        }
        drop(map);
        match self.reader.get_last_snapshot(terminal_id).await {
            Some(snapshot) if !snapshot.account_id.is_empty() => Some(snapshot.account_id),
            _ => Some(terminal_id.to_string()),
        }
    }

    async fn follower_by_account(&self, account_id: &str) -> Option<(CopierGroup, FollowerConfig)> {
        let groups = self.groups.read().await;
        for group in groups.iter() {
            if let Some(follower) = group
                .followers
                .iter()
                .find(|f| f.account_id == account_id)
            {
                return Some((group.clone(), follower.clone()));
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn push_activity(
        &self,
        group: &CopierGroup,
        follower: &FollowerConfig,
        activity_type: ActivityType,
        symbol: &str,
        action: &str,
        volume: f64,
        price: f64,
        latency: u64,
        status: &str,
        error_message: Option<String>,
    ) {
        let entry = ActivityEntry {
            id: uuid::Uuid::new_v4().to_string(),
            group_id: group.id.clone(),
            follower_id: follower.id.clone(),
            timestamp: Utc::now(),
            activity_type,
            symbol: symbol.to_string(),
            action: action.to_string(),
            volume,
            price,
            latency,
            status: status.to_string(),
            error_message,
        };
        let mut activity = self.activity.write().await;
        activity.push_back(entry.clone());
        while activity.len() > ACTIVITY_CAP {
            activity.pop_front();
        }
        drop(activity);
        let _ = self.events_tx.send(CopierEvent::Activity(entry));
    }

    // -- persistence -------------------------------------------------------

    fn schedule_save(self: &Arc<Self>) {
        if self.save_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(engine.save_debounce).await;
            engine.save_pending.store(false, Ordering::SeqCst);
            engine.flush().await;
        });
    }

    /// Write all copier state files. Best-effort; failures never touch the
    /// in-memory state.
    pub async fn flush(&self) {
        let correlations = self.correlations.read().await.clone();
        if let Err(e) =
            crate::persistence::write_json(&self.data_dir.join(CORRELATIONS_FILE), &correlations)
        {
            tracing::warn!("Failed to persist correlations: {}", e);
        }
        let activity: Vec<ActivityEntry> = self.activity.read().await.iter().cloned().collect();
        if let Err(e) = crate::persistence::write_json(&self.data_dir.join(ACTIVITY_FILE), &activity)
        {
            tracing::warn!("Failed to persist activity log: {}", e);
        }
        let stats = self.stats.read().await.clone();
        if let Err(e) = crate::persistence::write_json(&self.data_dir.join(STATS_FILE), &stats) {
            tracing::warn!("Failed to persist follower stats: {}", e);
        }
        let watermarks = self.watermarks.read().await.clone();
        if let Err(e) =
            crate::persistence::write_json(&self.data_dir.join(WATERMARK_FILE), &watermarks)
        {
            tracing::warn!("Failed to persist offline watermarks: {}", e);
        }
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.listen_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.flush().await;
    }
}
