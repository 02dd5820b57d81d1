//! Client message decoding and reply framing.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{CommandResult, PushEvent};
use crate::engine::{ControlReply, ControlRequest};
use crate::error::ControlError;
use crate::trading::TradingMode;

#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

fn bad(msg: impl Into<String>) -> ControlError {
    ControlError::BadRequest(msg.into())
}

/// Reads a field either as the payload itself or as `payload[key]`.
fn scalar<'a>(payload: &'a Value, keys: &[&str]) -> &'a Value {
    keys.iter().find_map(|k| payload.get(*k)).unwrap_or(payload)
}

/// Decodes a `{"type": ..., "payload": ...}` client message.
pub fn parse_request(text: &str) -> Result<ControlRequest, ControlError> {
    let msg: Incoming = serde_json::from_str(text).map_err(|e| bad(e.to_string()))?;
    let req = match msg.kind.as_str() {
        "GET_FULL_SCANNER_LIST" => ControlRequest::GetFullScannerList,
        "GET_STATUS" => ControlRequest::GetStatus,
        "START_BOT" => ControlRequest::StartBot,
        "STOP_BOT" => ControlRequest::StopBot,
        "CLEAR_DATA" => ControlRequest::ClearData,
        "GET_SETTINGS" => ControlRequest::GetSettings,
        "GET_POSITIONS" => ControlRequest::GetPositions,
        "GET_HISTORY" => ControlRequest::GetHistory,
        "GET_PERFORMANCE_STATS" => ControlRequest::GetPerformanceStats,
        "SET_MODE" => {
            let mode: TradingMode = serde_json::from_value(scalar(&msg.payload, &["mode"]).clone())
                .map_err(|_| bad(format!("invalid mode {}", msg.payload)))?;
            ControlRequest::SetMode(mode)
        }
        "CLOSE_TRADE" => {
            let id = scalar(&msg.payload, &["id", "trade_id", "tradeId"]);
            let id = id
                .as_u64()
                .or_else(|| id.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| bad(format!("invalid trade id {}", msg.payload)))?;
            ControlRequest::CloseTrade(id)
        }
        "UPDATE_SETTINGS" => {
            if !msg.payload.is_object() {
                return Err(bad("settings payload must be an object"));
            }
            ControlRequest::UpdateSettings(msg.payload)
        }
        other => return Err(bad(format!("unknown request type {other}"))),
    };
    Ok(req)
}

/// The frame sent back to the requesting socket. A scanner list request is
/// answered with a `FULL_SCANNER_LIST` frame, everything else with a
/// `COMMAND_RESULT`.
pub fn reply_frame(request: &str, reply: ControlReply) -> Value {
    match reply {
        Ok(data) if request == "GET_FULL_SCANNER_LIST" => json!({ "type": "FULL_SCANNER_LIST", "payload": data }),
        Ok(data) => result_frame(CommandResult { request: request.to_string(), ok: true, data: Some(data), error: None }),
        Err(e) => result_frame(CommandResult { request: request.to_string(), ok: false, data: None, error: Some(e.to_string()) }),
    }
}

fn result_frame(result: CommandResult) -> Value {
    serde_json::to_value(PushEvent::CommandResult(result)).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_requests() {
        assert_eq!(parse_request(r#"{"type":"START_BOT"}"#), Ok(ControlRequest::StartBot));
        assert_eq!(parse_request(r#"{"type":"GET_FULL_SCANNER_LIST","payload":null}"#), Ok(ControlRequest::GetFullScannerList));
        assert_eq!(parse_request(r#"{"type":"GET_PERFORMANCE_STATS"}"#), Ok(ControlRequest::GetPerformanceStats));
    }

    #[test]
    fn test_payload_shapes() {
        assert_eq!(
            parse_request(r#"{"type":"SET_MODE","payload":"REAL_PAPER"}"#),
            Ok(ControlRequest::SetMode(TradingMode::RealPaper))
        );
        assert_eq!(
            parse_request(r#"{"type":"SET_MODE","payload":{"mode":"VIRTUAL"}}"#),
            Ok(ControlRequest::SetMode(TradingMode::Virtual))
        );
        assert_eq!(parse_request(r#"{"type":"CLOSE_TRADE","payload":4}"#), Ok(ControlRequest::CloseTrade(4)));
        assert_eq!(parse_request(r#"{"type":"CLOSE_TRADE","payload":{"id":"9"}}"#), Ok(ControlRequest::CloseTrade(9)));
        assert_eq!(
            parse_request(r#"{"type":"UPDATE_SETTINGS","payload":{"MAX_OPEN_POSITIONS":3}}"#),
            Ok(ControlRequest::UpdateSettings(json!({ "MAX_OPEN_POSITIONS": 3 })))
        );
    }

    #[test]
    fn test_bad_requests() {
        assert!(matches!(parse_request("{}"), Err(ControlError::BadRequest(_))));
        assert!(matches!(parse_request(r#"{"type":"REBOOT"}"#), Err(ControlError::BadRequest(_))));
        assert!(matches!(parse_request(r#"{"type":"SET_MODE","payload":"TURBO"}"#), Err(ControlError::BadRequest(_))));
        assert!(matches!(parse_request(r#"{"type":"CLOSE_TRADE","payload":-1}"#), Err(ControlError::BadRequest(_))));
        assert!(matches!(parse_request(r#"{"type":"UPDATE_SETTINGS","payload":[1]}"#), Err(ControlError::BadRequest(_))));
    }

    #[test]
    fn test_reply_frames() {
        let list = reply_frame("GET_FULL_SCANNER_LIST", Ok(json!([])));
        assert_eq!(list, json!({ "type": "FULL_SCANNER_LIST", "payload": [] }));

        let refused = reply_frame("CLOSE_TRADE", Err(ControlError::UnknownTrade(3)));
        assert_eq!(refused["type"], "COMMAND_RESULT");
        assert_eq!(refused["payload"]["ok"], false);
        assert_eq!(refused["payload"]["error"], "no open trade with id 3");
    }
}
