// bridge-core/src/copier/offline_sync.rs
//
// Slave terminals keep trading while the desktop app is down and append
// their closes to a per-account JSONL log. On start the engine replays
// entries newer than the persisted watermark so follower P/L survives
// offline periods. Malformed lines are skipped silently.

use super::CopierEngine;
use crate::models::ActivityType;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfflineTradeRecord {
    event: String,
    timestamp_unix: i64,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    lots: f64,
    #[serde(default)]
    profit: f64,
    #[serde(default)]
    swap: f64,
    #[serde(default)]
    commission: f64,
}

impl CopierEngine {
    /// Replay offline COPY_CLOSE entries for every configured follower.
    /// Returns the number of trades credited.
    pub async fn sync_offline_trades(self: &Arc<Self>) -> usize {
        let groups = self.groups.read().await.clone();
        let mut processed = 0;

        for group in &groups {
            for follower in &group.followers {
                let login = follower.account_id.clone();
                let path = self
                    .trade_log_dir
                    .join(format!("{}.trades.jsonl", login));
                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(_) => continue,
                };

                let watermark = self
                    .watermarks
                    .read()
                    .await
                    .get(&login)
                    .copied()
                    .unwrap_or(0);
                let mut newest = watermark;

                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let record: OfflineTradeRecord = match serde_json::from_str(line) {
                        Ok(record) => record,
                        Err(_) => continue,
                    };
                    if record.event != "COPY_CLOSE" || record.timestamp_unix <= watermark {
                        continue;
                    }

                    let profit = record.profit + record.swap + record.commission;
                    {
                        let mut stats = self.stats.write().await;
                        let entry = stats.entry(follower.id.clone()).or_default();
                        entry.credit_profit(profit);
                        entry.record_external_trade(Utc::now().date_naive());
                    }
                    self.push_activity(
                        group,
                        follower,
                        ActivityType::Close,
                        &record.symbol,
                        "offline close",
                        record.lots,
                        0.0,
                        0,
                        "success",
                        None,
                    )
                    .await;
                    newest = newest.max(record.timestamp_unix);
                    processed += 1;
                }

                if newest > watermark {
                    self.watermarks.write().await.insert(login, newest);
                }
            }
        }

        if processed > 0 {
            tracing::info!("Offline sync credited {} trade(s)", processed);
            self.flush().await;
        }
        processed
    }
}
