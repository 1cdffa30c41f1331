use super::{AccountSnapshot, HeartbeatUpdate, Platform, Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of event types a terminal-side agent can publish.
/// This set is part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "CONNECTED")]
    Connected,
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "POSITION_OPENED")]
    PositionOpened,
    #[serde(rename = "POSITION_CLOSED")]
    PositionClosed,
    #[serde(rename = "POSITION_MODIFIED")]
    PositionModified,
    #[serde(rename = "POSITION_REVERSED")]
    PositionReversed,
    #[serde(rename = "DEAL_EXECUTED")]
    DealExecuted,
    #[serde(rename = "ORDER_PLACED")]
    OrderPlaced,
    #[serde(rename = "ORDER_CANCELLED")]
    OrderCancelled,
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate,
    #[serde(rename = "PRICE_UPDATE")]
    PriceUpdate,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "RESUMED")]
    Resumed,
}

/// Wire envelope of a PUB/SUB frame: `{type, eventIndex?, timestamp, platform,
/// accountId, data?}`. Legacy SNAPSHOT frames carry account fields at the top
/// level, captured by `extra`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub event_index: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A position-close payload; `entry=OUT` marks a deal-out close reported by an
/// autonomous slave.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClosedPosition {
    #[serde(flatten)]
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

impl ClosedPosition {
    pub fn realized_profit(&self) -> f64 {
        self.position.composite_profit()
    }

    pub fn is_deal_out(&self) -> bool {
        matches!(self.entry.as_deref(), Some("OUT"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub symbol: String,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
}

/// Normalized terminal event. Produced by a single construction point
/// (`bridge::normalize`); every listener consumes this shape, never raw frames.
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    Connected(AccountSnapshot),
    Disconnected { reason: Option<String> },
    Heartbeat(HeartbeatUpdate),
    PositionOpened(Position),
    PositionClosed(ClosedPosition),
    PositionModified(Position),
    PositionReversed(Position),
    DealExecuted(Value),
    OrderPlaced(Value),
    OrderCancelled(Value),
    AccountUpdate(AccountSnapshot),
    PriceUpdate(PriceUpdate),
    Paused,
    Resumed,
}

impl TerminalEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TerminalEvent::Connected(_) => EventKind::Connected,
            TerminalEvent::Disconnected { .. } => EventKind::Disconnected,
            TerminalEvent::Heartbeat(_) => EventKind::Heartbeat,
            TerminalEvent::PositionOpened(_) => EventKind::PositionOpened,
            TerminalEvent::PositionClosed(_) => EventKind::PositionClosed,
            TerminalEvent::PositionModified(_) => EventKind::PositionModified,
            TerminalEvent::PositionReversed(_) => EventKind::PositionReversed,
            TerminalEvent::DealExecuted(_) => EventKind::DealExecuted,
            TerminalEvent::OrderPlaced(_) => EventKind::OrderPlaced,
            TerminalEvent::OrderCancelled(_) => EventKind::OrderCancelled,
            TerminalEvent::AccountUpdate(_) => EventKind::AccountUpdate,
            TerminalEvent::PriceUpdate(_) => EventKind::PriceUpdate,
            TerminalEvent::Paused => EventKind::Paused,
            TerminalEvent::Resumed => EventKind::Resumed,
        }
    }
}

/// Split a SUB frame into its topic and JSON body.
///
/// Frames are either `TOPIC|<json>` with TOPIC in {EVENT, SNAPSHOT}, or bare
/// JSON. The separator is only honored within the first 20 bytes; anything
/// else is treated as a whole-frame JSON body.
pub fn split_frame(frame: &[u8]) -> (Option<&[u8]>, &[u8]) {
    let window = &frame[..frame.len().min(20)];
    if let Some(idx) = window.iter().position(|&b| b == b'|') {
        let topic = &frame[..idx];
        if topic == b"EVENT" || topic == b"SNAPSHOT" {
            return (Some(topic), &frame[idx + 1..]);
        }
    }
    (None, frame)
}
