//! OCPP-J message framing
//!
//! The gateway bridges OCPP 1.6-J, where every message is a JSON array:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`
//!
//! Frames are parsed only for inspection (state updates, response
//! consumption, stop-command priority). Forwarding between charger and CSMS
//! always uses the original text, so foreign payloads are never re-encoded
//! and no schema validation is attempted.

use serde_json::Value;
use thiserror::Error;

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// A parsed OCPP-J envelope.
#[derive(Debug, Clone)]
pub enum OcppFrame {
    /// `[2, uniqueId, action, payload]`
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, uniqueId, payload]`
    CallResult { unique_id: String, payload: Value },
    /// `[4, uniqueId, errorCode, errorDescription, errorDetails]`
    CallError { unique_id: String, error_code: String },
}

impl OcppFrame {
    /// Parse raw frame text into an envelope.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;

        let msg_type = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or(FrameError::MissingMessageType)?;

        let unique_id = arr
            .get(1)
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingUniqueId)?
            .to_string();

        match msg_type {
            MSG_TYPE_CALL => {
                let action = arr
                    .get(2)
                    .and_then(Value::as_str)
                    .ok_or(FrameError::MissingAction)?
                    .to_string();
                let payload = arr.get(3).cloned().unwrap_or(Value::Null);
                Ok(Self::Call {
                    unique_id,
                    action,
                    payload,
                })
            }
            MSG_TYPE_CALL_RESULT => {
                let payload = arr.get(2).cloned().unwrap_or(Value::Null);
                Ok(Self::CallResult { unique_id, payload })
            }
            MSG_TYPE_CALL_ERROR => {
                let error_code = arr
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or("GenericError")
                    .to_string();
                Ok(Self::CallError {
                    unique_id,
                    error_code,
                })
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// Build a gateway-originated `Call` frame.
    pub fn call(unique_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self::Call {
            unique_id: unique_id.into(),
            action: action.into(),
            payload,
        }
    }

    /// Serialize this frame to wire text.
    pub fn serialize(&self) -> String {
        let arr = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => serde_json::json!([MSG_TYPE_CALL, unique_id, action, payload]),
            Self::CallResult { unique_id, payload } => {
                serde_json::json!([MSG_TYPE_CALL_RESULT, unique_id, payload])
            }
            Self::CallError {
                unique_id,
                error_code,
            } => serde_json::json!([MSG_TYPE_CALL_ERROR, unique_id, error_code, "", {}]),
        };
        // serializing a Value never fails
        serde_json::to_string(&arr).unwrap()
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Returns `true` for a `Call` frame with the given action name.
    pub fn is_call_for(&self, wanted: &str) -> bool {
        matches!(self, Self::Call { action, .. } if action == wanted)
    }

    pub fn is_call_result(&self) -> bool {
        matches!(self, Self::CallResult { .. })
    }
}

/// Errors raised while parsing an OCPP-J envelope.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message type missing or not a number")]
    MissingMessageType,
    #[error("uniqueId missing or not a string")]
    MissingUniqueId,
    #[error("action missing or not a string")]
    MissingAction,
    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_call() {
        let text = r#"[2,"1001","StatusNotification",{"connectorId":1,"status":"Charging"}]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                assert_eq!(unique_id, "1001");
                assert_eq!(action, "StatusNotification");
                assert_eq!(payload["status"], "Charging");
            }
            other => panic!("expected Call, got {:?}", other),
        }
    }

    #[test]
    fn parse_call_result() {
        let frame = OcppFrame::parse(r#"[3,"77",{"status":"Accepted"}]"#).unwrap();
        assert!(frame.is_call_result());
        assert_eq!(frame.unique_id(), "77");
    }

    #[test]
    fn parse_call_error() {
        match OcppFrame::parse(r#"[4,"9","NotImplemented","no such action",{}]"#).unwrap() {
            OcppFrame::CallError {
                unique_id,
                error_code,
            } => {
                assert_eq!(unique_id, "9");
                assert_eq!(error_code, "NotImplemented");
            }
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(OcppFrame::parse("not json").is_err());
        assert!(OcppFrame::parse("{}").is_err());
        assert!(OcppFrame::parse(r#"[9,"x"]"#).is_err());
        assert!(OcppFrame::parse(r#"[2,42,"Heartbeat",{}]"#).is_err());
    }

    #[test]
    fn call_roundtrip_preserves_header() {
        let frame = OcppFrame::call("abc", "TriggerMessage", serde_json::json!({"requestedMessage": "MeterValues"}));
        let parsed = OcppFrame::parse(&frame.serialize()).unwrap();
        assert!(parsed.is_call_for("TriggerMessage"));
        assert_eq!(parsed.unique_id(), "abc");
    }

    #[test]
    fn detects_remote_stop() {
        let frame = OcppFrame::parse(r#"[2,"5","RemoteStopTransaction",{"transactionId":7}]"#).unwrap();
        assert!(frame.is_call_for("RemoteStopTransaction"));
        assert!(!frame.is_call_for("RemoteStartTransaction"));
    }
}
