use super::TradeSide;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// REQ/REP command set. One JSON object per request, tagged by `action`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action")]
pub enum TerminalCommand {
    #[serde(rename = "PAUSE")]
    Pause,
    #[serde(rename = "RESUME")]
    Resume,
    #[serde(rename = "CLOSE_ALL")]
    CloseAll,
    #[serde(rename = "CLOSE_POSITION", rename_all = "camelCase")]
    ClosePosition { position_id: String },
    #[serde(rename = "OPEN_POSITION", rename_all = "camelCase")]
    OpenPosition {
        symbol: String,
        side: TradeSide,
        volume: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sl: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tp: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        magic: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deviation: Option<u32>,
    },
    #[serde(rename = "MODIFY_POSITION", rename_all = "camelCase")]
    ModifyPosition {
        ticket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sl: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tp: Option<f64>,
    },
    #[serde(rename = "STATUS")]
    Status,
    #[serde(rename = "GET_ACCOUNT")]
    GetAccount,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "CONFIG")]
    Config,
    #[serde(rename = "SET_CONFIG")]
    SetConfig { params: Value },
    #[serde(rename = "GET_HISTORY")]
    GetHistory { days: u32 },
}

impl TerminalCommand {
    pub fn action(&self) -> &'static str {
        match self {
            TerminalCommand::Pause => "PAUSE",
            TerminalCommand::Resume => "RESUME",
            TerminalCommand::CloseAll => "CLOSE_ALL",
            TerminalCommand::ClosePosition { .. } => "CLOSE_POSITION",
            TerminalCommand::OpenPosition { .. } => "OPEN_POSITION",
            TerminalCommand::ModifyPosition { .. } => "MODIFY_POSITION",
            TerminalCommand::Status => "STATUS",
            TerminalCommand::GetAccount => "GET_ACCOUNT",
            TerminalCommand::Ping => "PING",
            TerminalCommand::Config => "CONFIG",
            TerminalCommand::SetConfig { .. } => "SET_CONFIG",
            TerminalCommand::GetHistory { .. } => "GET_HISTORY",
        }
    }
}

/// Result object returned by every operation that can fail in expected ways.
/// `payload` carries action-specific reply fields (`pong`, `ticket`, account
/// state, ...).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, Value>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Follower ticket from an OPEN_POSITION reply; agents report it as
    /// either `ticket` or `positionId`, numeric or string.
    pub fn ticket(&self) -> Option<String> {
        let raw = self.field("ticket").or_else(|| self.field("positionId"))?;
        match raw {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_wire_shape() {
        let json = serde_json::to_value(&TerminalCommand::Ping).unwrap();
        assert_eq!(json, serde_json::json!({"action": "PING"}));
    }

    #[test]
    fn test_open_position_omits_absent_options() {
        let cmd = TerminalCommand::OpenPosition {
            symbol: "EURUSD.m".to_string(),
            side: TradeSide::Sell,
            volume: 2.0,
            sl: None,
            tp: None,
            magic: Some(123456),
            comment: Some("HE Copy 12345".to_string()),
            deviation: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"action\":\"OPEN_POSITION\""));
        assert!(json.contains("\"side\":\"SELL\""));
        assert!(!json.contains("\"sl\""));
        assert!(!json.contains("\"deviation\""));
    }

    #[test]
    fn test_close_position_camel_case() {
        let cmd = TerminalCommand::ClosePosition {
            position_id: "98765".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"positionId\":\"98765\""));
    }

    #[test]
    fn test_response_flattened_payload() {
        let json = r#"{"success":true,"pong":true}"#;
        let resp: CommandResponse = serde_json::from_str(json).unwrap();
        assert!(resp.success);
        assert_eq!(resp.field("pong"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_response_ticket_variants() {
        let resp: CommandResponse =
            serde_json::from_str(r#"{"success":true,"ticket":98765}"#).unwrap();
        assert_eq!(resp.ticket().as_deref(), Some("98765"));

        let resp: CommandResponse =
            serde_json::from_str(r#"{"success":true,"positionId":"777"}"#).unwrap();
        assert_eq!(resp.ticket().as_deref(), Some("777"));
    }

    #[test]
    fn test_failure_response() {
        let resp = CommandResponse::failure("Terminal not connected");
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("Terminal not connected"));
    }
}
