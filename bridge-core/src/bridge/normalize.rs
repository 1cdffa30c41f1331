// bridge-core/src/bridge/normalize.rs
//
// Single construction point for terminal events. Every raw SUB frame (and
// every polled STATUS payload) passes through SnapshotState::ingest_frame,
// which owns the per-terminal cached snapshot, rewrites legacy frames, and
// synthesizes position events by diffing snapshots from non-event-driven
// peers. Parse failures log and drop the frame.

use crate::models::{
    split_frame, AccountSnapshot, ClosedPosition, EventEnvelope, HeartbeatUpdate, Position,
    PriceUpdate, TerminalEvent,
};
use serde_json::Value;

#[derive(Default)]
pub struct SnapshotState {
    snapshot: Option<AccountSnapshot>,
    /// Legacy peers send bare SNAPSHOT frames; the first one per bridge
    /// lifetime is a CONNECTED, the rest are ACCOUNT_UPDATEs.
    first_snapshot_seen: bool,
    /// Latest event-driven advertisement from the peer; snapshot diffing is
    /// skipped while true.
    event_driven: bool,
}

impl SnapshotState {
    pub fn snapshot(&self) -> Option<&AccountSnapshot> {
        self.snapshot.as_ref()
    }

    /// Merge a partial update into the cached snapshot, if any.
    pub fn merge_heartbeat(&mut self, update: &HeartbeatUpdate) {
        if let Some(ref mut snapshot) = self.snapshot {
            snapshot.merge_heartbeat(update);
        }
    }

    pub fn ingest_frame(&mut self, terminal_id: &str, frame: &[u8]) -> Vec<TerminalEvent> {
        let (_topic, body) = split_frame(frame);
        let raw: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("[{}] Dropping unparseable frame: {}", terminal_id, e);
                return Vec::new();
            }
        };
        let envelope: EventEnvelope = match serde_json::from_value(raw.clone()) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("[{}] Dropping frame with no event shape: {}", terminal_id, e);
                return Vec::new();
            }
        };
        self.ingest_envelope(terminal_id, envelope, raw)
    }

    pub fn ingest_envelope(
        &mut self,
        terminal_id: &str,
        envelope: EventEnvelope,
        raw: Value,
    ) -> Vec<TerminalEvent> {
        match envelope.event_type.as_str() {
            "SNAPSHOT" => self.ingest_legacy_snapshot(terminal_id, &envelope, raw),
            "GOODBYE" => {
                let reason = envelope
                    .extra
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                vec![TerminalEvent::Disconnected { reason }]
            }
            "CONNECTED" => match self.parse_snapshot(&envelope, &raw) {
                Some(snapshot) => {
                    self.first_snapshot_seen = true;
                    self.event_driven = snapshot.event_driven;
                    self.snapshot = Some(snapshot.clone());
                    vec![TerminalEvent::Connected(snapshot)]
                }
                None => self.drop_frame(terminal_id, "CONNECTED"),
            },
            "ACCOUNT_UPDATE" => match self.parse_snapshot(&envelope, &raw) {
                Some(snapshot) => self.apply_account_update(snapshot),
                None => self.drop_frame(terminal_id, "ACCOUNT_UPDATE"),
            },
            "DISCONNECTED" => {
                let reason = payload(&envelope)
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                vec![TerminalEvent::Disconnected { reason }]
            }
            "HEARTBEAT" => {
                let update: HeartbeatUpdate =
                    match serde_json::from_value(payload_or_raw(&envelope, &raw)) {
                        Ok(update) => update,
                        Err(_) => return self.drop_frame(terminal_id, "HEARTBEAT"),
                    };
                if let Some(ref mut snapshot) = self.snapshot {
                    snapshot.merge_heartbeat(&update);
                }
                vec![TerminalEvent::Heartbeat(update)]
            }
            "POSITION_OPENED" => match self.parse_position(&envelope) {
                Some(position) => {
                    self.upsert_position(&position);
                    vec![TerminalEvent::PositionOpened(position)]
                }
                None => self.drop_frame(terminal_id, "POSITION_OPENED"),
            },
            "POSITION_CLOSED" => {
                let closed: ClosedPosition = match envelope
                    .data
                    .clone()
                    .and_then(|data| serde_json::from_value(data).ok())
                {
                    Some(closed) => closed,
                    None => return self.drop_frame(terminal_id, "POSITION_CLOSED"),
                };
                self.remove_position(&closed.position.id);
                vec![TerminalEvent::PositionClosed(closed)]
            }
            "POSITION_MODIFIED" => match self.parse_position(&envelope) {
                Some(position) => {
                    self.upsert_position(&position);
                    vec![TerminalEvent::PositionModified(position)]
                }
                None => self.drop_frame(terminal_id, "POSITION_MODIFIED"),
            },
            "POSITION_REVERSED" => match self.parse_position(&envelope) {
                Some(position) => {
                    self.upsert_position(&position);
                    vec![TerminalEvent::PositionReversed(position)]
                }
                None => self.drop_frame(terminal_id, "POSITION_REVERSED"),
            },
            "DEAL_EXECUTED" => vec![TerminalEvent::DealExecuted(payload_or_raw(&envelope, &raw))],
            "ORDER_PLACED" => vec![TerminalEvent::OrderPlaced(payload_or_raw(&envelope, &raw))],
            "ORDER_CANCELLED" => {
                vec![TerminalEvent::OrderCancelled(payload_or_raw(&envelope, &raw))]
            }
            "PRICE_UPDATE" => {
                let update: PriceUpdate =
                    match serde_json::from_value(payload_or_raw(&envelope, &raw)) {
                        Ok(update) => update,
                        Err(_) => return self.drop_frame(terminal_id, "PRICE_UPDATE"),
                    };
                self.apply_price(&update);
                vec![TerminalEvent::PriceUpdate(update)]
            }
            "PAUSED" => {
                if let Some(ref mut snapshot) = self.snapshot {
                    snapshot.is_paused = true;
                }
                vec![TerminalEvent::Paused]
            }
            "RESUMED" => {
                if let Some(ref mut snapshot) = self.snapshot {
                    snapshot.is_paused = false;
                }
                vec![TerminalEvent::Resumed]
            }
            other => {
                tracing::warn!("[{}] Dropping frame with unknown type {}", terminal_id, other);
                Vec::new()
            }
        }
    }

    /// Legacy SNAPSHOT frames carry account fields at the top level. The
    /// first one per bridge lifetime becomes CONNECTED, later ones become
    /// ACCOUNT_UPDATEs.
    fn ingest_legacy_snapshot(
        &mut self,
        terminal_id: &str,
        envelope: &EventEnvelope,
        raw: Value,
    ) -> Vec<TerminalEvent> {
        let snapshot = match self.parse_snapshot(envelope, &raw) {
            Some(snapshot) => snapshot,
            None => return self.drop_frame(terminal_id, "SNAPSHOT"),
        };
        if !self.first_snapshot_seen {
            self.first_snapshot_seen = true;
            self.event_driven = snapshot.event_driven;
            self.snapshot = Some(snapshot.clone());
            vec![TerminalEvent::Connected(snapshot)]
        } else {
            self.apply_account_update(snapshot)
        }
    }

    /// Replace the cached snapshot; for non-event-driven peers, first emit
    /// synthetic closes (composite profit) and opens derived from the
    /// position diff, in that order, before the ACCOUNT_UPDATE itself.
    fn apply_account_update(&mut self, mut snapshot: AccountSnapshot) -> Vec<TerminalEvent> {
        self.event_driven = snapshot.event_driven;
        let mut events = Vec::new();

        if !self.event_driven {
            if let Some(ref previous) = self.snapshot {
                for old in &previous.positions {
                    if snapshot.find_position(&old.id).is_none() {
                        let mut position = old.clone();
                        position.profit = old.composite_profit();
                        position.swap = 0.0;
                        position.commission = 0.0;
                        events.push(TerminalEvent::PositionClosed(ClosedPosition {
                            position,
                            entry: None,
                        }));
                    }
                }
                for new in &snapshot.positions {
                    if previous.find_position(&new.id).is_none() {
                        events.push(TerminalEvent::PositionOpened(new.clone()));
                    }
                }
            }
        }

        snapshot.recompute_derived();
        self.first_snapshot_seen = true;
        self.snapshot = Some(snapshot.clone());
        events.push(TerminalEvent::AccountUpdate(snapshot));
        events
    }

    fn parse_snapshot(&self, envelope: &EventEnvelope, raw: &Value) -> Option<AccountSnapshot> {
        let mut snapshot: AccountSnapshot =
            serde_json::from_value(payload_or_raw(envelope, raw)).ok()?;
        if snapshot.account_id.is_empty() {
            if let Some(ref account_id) = envelope.account_id {
                snapshot.account_id = account_id.clone();
            }
        }
        if snapshot.timestamp.is_none() {
            snapshot.timestamp = envelope.timestamp;
        }
        snapshot.recompute_derived();
        Some(snapshot)
    }

    fn parse_position(&self, envelope: &EventEnvelope) -> Option<Position> {
        envelope
            .data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok())
    }

    fn upsert_position(&mut self, position: &Position) {
        if let Some(ref mut snapshot) = self.snapshot {
            match snapshot.positions.iter_mut().find(|p| p.id == position.id) {
                Some(existing) => *existing = position.clone(),
                None => snapshot.positions.push(position.clone()),
            }
            snapshot.recompute_derived();
        }
    }

    fn remove_position(&mut self, id: &str) {
        if let Some(ref mut snapshot) = self.snapshot {
            snapshot.positions.retain(|p| p.id != id);
            snapshot.recompute_derived();
        }
    }

    fn apply_price(&mut self, update: &PriceUpdate) {
        if let Some(ref mut snapshot) = self.snapshot {
            for position in &mut snapshot.positions {
                if position.symbol == update.symbol {
                    position.current_price = update.bid;
                }
            }
        }
    }

    fn drop_frame(&self, terminal_id: &str, kind: &str) -> Vec<TerminalEvent> {
        tracing::warn!("[{}] Dropping malformed {} frame", terminal_id, kind);
        Vec::new()
    }
}

fn payload(envelope: &EventEnvelope) -> Value {
    envelope
        .data
        .clone()
        .unwrap_or_else(|| Value::Object(envelope.extra.clone()))
}

/// Event payload: the `data` field when present, the whole frame otherwise
/// (legacy frames put everything at the top level).
fn payload_or_raw(envelope: &EventEnvelope, raw: &Value) -> Value {
    match envelope.data {
        Some(ref data) if data.is_object() => data.clone(),
        _ => raw.clone(),
    }
}
