use serde::{Deserialize, Serialize};

/// Trade direction as reported by the terminal-side agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl TradeSide {
    /// The reverse-hedge direction
    pub fn opposite(&self) -> Self {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical open position, shared by both transports.
/// Immutable on open; price/profit/swap/commission mutate via later snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Broker ticket
    pub id: String,
    pub symbol: String,
    pub side: TradeSide,
    /// Raw units as reported by the terminal (may be lots on some brokers)
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub volume_lots: f64,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub profit: f64,
    #[serde(default)]
    pub swap: f64,
    #[serde(default)]
    pub commission: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_time: Option<String>,
    #[serde(default)]
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digits: Option<u32>,
    /// Strategy magic number, when the terminal reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic: Option<i64>,
}

impl Position {
    /// Realised result including financing costs
    pub fn composite_profit(&self) -> f64 {
        self.profit + self.swap + self.commission
    }

    /// Best-effort lot size: prefers the explicit lots field, otherwise
    /// normalizes raw units (anything above 100 is treated as units).
    pub fn lots(&self) -> f64 {
        if self.volume_lots > 0.0 {
            self.volume_lots
        } else {
            normalize_lots(self.volume)
        }
    }
}

/// Leader volume may arrive as raw units; divide by the standard contract
/// size when the number is clearly not a lot count.
pub fn normalize_lots(volume: f64) -> f64 {
    if volume > 100.0 {
        volume / 100_000.0
    } else {
        volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(volume: f64, volume_lots: f64) -> Position {
        Position {
            id: "12345".to_string(),
            symbol: "EURUSD".to_string(),
            side: TradeSide::Buy,
            volume,
            volume_lots,
            entry_price: 1.1,
            current_price: 1.2,
            stop_loss: None,
            take_profit: None,
            profit: 50.0,
            swap: -1.0,
            commission: -2.0,
            open_time: None,
            comment: String::new(),
            digits: None,
            magic: None,
        }
    }

    #[test]
    fn test_opposite_side() {
        assert_eq!(TradeSide::Buy.opposite(), TradeSide::Sell);
        assert_eq!(TradeSide::Sell.opposite(), TradeSide::Buy);
    }

    #[test]
    fn test_composite_profit_includes_costs() {
        assert_eq!(position(1.0, 1.0).composite_profit(), 47.0);
    }

    #[test]
    fn test_lots_prefers_explicit_field() {
        assert_eq!(position(100_000.0, 1.5).lots(), 1.5);
    }

    #[test]
    fn test_lots_normalizes_raw_units() {
        assert_eq!(position(100_000.0, 0.0).lots(), 1.0);
        assert_eq!(position(0.5, 0.0).lots(), 0.5);
    }

    #[test]
    fn test_side_wire_format() {
        let json = serde_json::to_string(&TradeSide::Sell).unwrap();
        assert_eq!(json, "\"SELL\"");
        let side: TradeSide = serde_json::from_str("\"BUY\"").unwrap();
        assert_eq!(side, TradeSide::Buy);
    }

    #[test]
    fn test_position_accepts_sparse_frames() {
        let p: Position =
            serde_json::from_str(r#"{"id":"7","symbol":"XAUUSD","side":"SELL"}"#).unwrap();
        assert_eq!(p.volume, 0.0);
        assert_eq!(p.comment, "");
        assert!(p.stop_loss.is_none());
    }
}
