//! OCPP 1.6J message framing
//!
//! OCPP-J carries one message per WebSocket text frame as a JSON array:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::types::*;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP 1.6 error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    /// Spelled this way on the wire by OCPP 1.6
    #[serde(rename = "OccurenceConstraintViolation")]
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    /// Wire spelling of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurrenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OCPP action names handled by this link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    // Charge point -> central system
    StatusNotification,
    MeterValues,
    StartTransaction,
    StopTransaction,

    // Central system -> charge point
    RemoteStartTransaction,
    RemoteStopTransaction,

    // Both directions
    Heartbeat,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::StatusNotification => "StatusNotification",
            Action::MeterValues => "MeterValues",
            Action::StartTransaction => "StartTransaction",
            Action::StopTransaction => "StopTransaction",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::Heartbeat => "Heartbeat",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "StatusNotification" => Ok(Action::StatusNotification),
            "MeterValues" => Ok(Action::MeterValues),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StopTransaction" => Ok(Action::StopTransaction),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            "Heartbeat" => Ok(Action::Heartbeat),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in OCPP message handling and transport
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("OCPP error from charge point: {code} - {description}")]
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected to charge point")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to hand frame to transport")]
    SendFailed,
}

/// OCPP CALL message (request)
///
/// The action is kept as the raw wire string so that unrecognized actions from
/// a charge point can still be answered with `NotImplemented`.
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with a fresh message ID
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Create Heartbeat call
    pub fn heartbeat() -> Result<Self, OcppError> {
        Self::new(Action::Heartbeat, HeartbeatRequest {})
    }

    /// Create RemoteStartTransaction call
    pub fn remote_start_transaction(
        connector_id: i32,
        id_tag: impl Into<String>,
    ) -> Result<Self, OcppError> {
        Self::new(
            Action::RemoteStartTransaction,
            RemoteStartTransactionRequest {
                connector_id: Some(connector_id),
                id_tag: id_tag.into(),
            },
        )
    }

    /// Create RemoteStopTransaction call
    pub fn remote_stop_transaction(transaction_id: i32) -> Result<Self, OcppError> {
        Self::new(
            Action::RemoteStopTransaction,
            RemoteStopTransactionRequest { transaction_id },
        )
    }

    /// The action, if it is one this link understands
    pub fn known_action(&self) -> Option<Action> {
        self.action.parse().ok()
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }

    /// Parse the payload as a specific request type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: String, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Response with an empty object payload (StatusNotification, MeterValues)
    pub fn empty(message_id: String) -> Self {
        Self {
            message_id,
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Create response for an incoming Heartbeat
    pub fn heartbeat(message_id: String) -> Result<Self, OcppError> {
        Self::new(
            message_id,
            HeartbeatResponse {
                current_time: chrono::Utc::now(),
            },
        )
    }

    /// Create response for an incoming StartTransaction
    pub fn start_transaction(message_id: String, transaction_id: i32) -> Result<Self, OcppError> {
        Self::new(
            message_id,
            StartTransactionResponse {
                id_tag_info: IdTagInfo::accepted(),
                transaction_id,
            },
        )
    }

    /// Create response for an incoming StopTransaction
    pub fn stop_transaction(message_id: String) -> Result<Self, OcppError> {
        Self::new(
            message_id,
            StopTransactionResponse {
                id_tag_info: Some(IdTagInfo::accepted()),
            },
        )
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message
    pub fn new(
        message_id: String,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Reply to a CALL whose action this link does not handle
    pub fn not_implemented(message_id: String, action: &str) -> Self {
        Self::new(
            message_id,
            ErrorCode::NotImplemented,
            format!("Action {} is not implemented", action),
        )
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.as_str(),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_string(&array)?)
    }

    /// Convert into the error returned to the caller that issued the CALL
    pub fn into_error(self) -> OcppError {
        OcppError::RemoteError {
            code: self.error_code,
            description: self.error_description,
            details: self.error_details,
        }
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from a text frame
    pub fn parse(text: &str) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_str(text)?;

        if array.is_empty() {
            return Err(OcppError::InvalidFormat);
        }

        let msg_type = array[0].as_i64().ok_or(OcppError::InvalidFormat)?;

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let action = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                Ok(OcppMessage::Call(Call {
                    message_id: message_id_at(&array)?,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id_at(&array)?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let error_code_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;
                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                let error_description = array[3].as_str().unwrap_or("").to_string();

                Ok(OcppMessage::CallError(CallError {
                    message_id: message_id_at(&array)?,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to a text frame
    pub fn to_text(&self) -> Result<String, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_text(),
            OcppMessage::CallResult(r) => r.to_text(),
            OcppMessage::CallError(e) => e.to_text(),
        }
    }
}

fn message_id_at(array: &[Value]) -> Result<String, OcppError> {
    array[1]
        .as_str()
        .map(str::to_string)
        .ok_or(OcppError::InvalidFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_serialization() {
        let call = Call::heartbeat().unwrap();
        let text = call.to_text().unwrap();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_remote_start_payload() {
        let call = Call::remote_start_transaction(1, "TAG123").unwrap();
        assert_eq!(call.action, "RemoteStartTransaction");
        assert_eq!(call.payload["connectorId"], 1);
        assert_eq!(call.payload["idTag"], "TAG123");
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Call::heartbeat().unwrap();
        let b = Call::heartbeat().unwrap();
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "m1", "StatusNotification", {"connectorId":1,"status":"Available","errorCode":"NoError"}]"#;
        let msg = OcppMessage::parse(json).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "m1");
                assert_eq!(call.known_action(), Some(Action::StatusNotification));
                let req: StatusNotificationRequest = call.parse_payload().unwrap();
                assert_eq!(req.status, ChargePointStatus::Available);
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_unknown_action_still_parses() {
        let json = r#"[2, "m2", "DataTransfer", {}]"#;
        match OcppMessage::parse(json).unwrap() {
            OcppMessage::Call(call) => {
                assert_eq!(call.action, "DataTransfer");
                assert_eq!(call.known_action(), None);
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"status": "Accepted"}]"#;
        match OcppMessage::parse(json).unwrap() {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id, "msg-123");
                let resp: RemoteStartTransactionResponse = result.parse_payload().unwrap();
                assert_eq!(resp.status, RemoteStartStopStatus::Accepted);
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "OccurenceConstraintViolation", "bad", {}]"#;
        match OcppMessage::parse(json).unwrap() {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::OccurrenceConstraintViolation);
                assert_eq!(error.error_description, "bad");
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_unrecognized_error_code_is_generic() {
        let json = r#"[4, "x", "SomethingElse", "", null]"#;
        match OcppMessage::parse(json).unwrap() {
            OcppMessage::CallError(error) => assert_eq!(error.error_code, ErrorCode::GenericError),
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(OcppMessage::parse("not json"), Err(OcppError::Json(_))));
        assert!(matches!(OcppMessage::parse("[]"), Err(OcppError::InvalidFormat)));
        assert!(matches!(OcppMessage::parse(r#"{"a":1}"#), Err(OcppError::Json(_))));
        assert!(matches!(OcppMessage::parse(r#"[3, "id"]"#), Err(OcppError::InvalidFormat)));
        assert!(matches!(OcppMessage::parse(r#"[2, 7, "Heartbeat", {}]"#), Err(OcppError::InvalidFormat)));
        assert!(matches!(OcppMessage::parse(r#"["2", "id", "Heartbeat", {}]"#), Err(OcppError::InvalidFormat)));
        assert!(matches!(
            OcppMessage::parse(r#"[5, "id", {}]"#),
            Err(OcppError::UnknownMessageType(5))
        ));
    }

    #[test]
    fn test_call_error_wire_format() {
        let error = CallError::not_implemented("m9".into(), "Reset");
        let value: Value = serde_json::from_str(&error.to_text().unwrap()).unwrap();
        assert_eq!(value[0], 4);
        assert_eq!(value[1], "m9");
        assert_eq!(value[2], "NotImplemented");
        assert!(value[4].is_object());
    }

    #[test]
    fn test_empty_call_result_wire_format() {
        let text = CallResult::empty("m1".into()).to_text().unwrap();
        assert_eq!(text, r#"[3,"m1",{}]"#);
    }
}
