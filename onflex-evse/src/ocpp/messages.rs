//! OCPP-J message framing
//!
//! OCPP 1.6 over WebSocket carries JSON arrays in text frames:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::types::*;
use crate::error::ErrorKind;

/// Length of generated message ids
pub const MESSAGE_ID_LEN: usize = 20;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP-J error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

/// OCPP action names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    // Charge point -> central system
    BootNotification,
    Heartbeat,
    StatusNotification,
    Authorize,
    StartTransaction,
    StopTransaction,
    MeterValues,
    FirmwareStatusNotification,

    // Central system -> charge point
    Reset,
    RemoteStartTransaction,
    RemoteStopTransaction,
    UpdateFirmware,

    // Bidirectional
    DataTransfer,

    /// Any action this charge point does not implement
    Other(String),
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Other(name) => f.write_str(name),
            known => write!(f, "{:?}", known),
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            "BootNotification" => Action::BootNotification,
            "Heartbeat" => Action::Heartbeat,
            "StatusNotification" => Action::StatusNotification,
            "Authorize" => Action::Authorize,
            "StartTransaction" => Action::StartTransaction,
            "StopTransaction" => Action::StopTransaction,
            "MeterValues" => Action::MeterValues,
            "FirmwareStatusNotification" => Action::FirmwareStatusNotification,
            "Reset" => Action::Reset,
            "RemoteStartTransaction" => Action::RemoteStartTransaction,
            "RemoteStopTransaction" => Action::RemoteStopTransaction,
            "UpdateFirmware" => Action::UpdateFirmware,
            "DataTransfer" => Action::DataTransfer,
            other => Action::Other(other.to_string()),
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("OCPP error from central system: {code:?} - {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("BootNotification not accepted: {0:?}")]
    BootRejected(RegistrationStatus),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl OcppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OcppError::Timeout => ErrorKind::ProtocolTimeout,
            OcppError::ConnectionClosed
            | OcppError::WebSocket(_)
            | OcppError::InvalidEndpoint(_) => ErrorKind::ConnectionFailure,
            OcppError::Json(_)
            | OcppError::InvalidFormat
            | OcppError::UnknownMessageType(_)
            | OcppError::Remote { .. }
            | OcppError::UnexpectedReply(_)
            | OcppError::BootRejected(_) => ErrorKind::ProtocolViolation,
        }
    }
}

/// Generate a fresh message id: a random UUID with separators stripped,
/// cut to [`MESSAGE_ID_LEN`] characters.
pub fn new_message_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(MESSAGE_ID_LEN);
    id
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with a generated id
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: new_message_id(),
            action,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn boot_notification(request: BootNotificationRequest) -> Result<Self, OcppError> {
        Self::new(Action::BootNotification, request)
    }

    pub fn heartbeat() -> Result<Self, OcppError> {
        Self::new(Action::Heartbeat, HeartbeatRequest {})
    }

    pub fn status_notification(connector_id: u32, status: ChargePointStatus) -> Result<Self, OcppError> {
        Self::new(
            Action::StatusNotification,
            StatusNotificationRequest {
                connector_id,
                error_code: ChargePointErrorCode::NoError,
                status,
            },
        )
    }

    pub fn authorize(id_tag: &str) -> Result<Self, OcppError> {
        Self::new(
            Action::Authorize,
            AuthorizeRequest {
                id_tag: id_tag.to_string(),
            },
        )
    }

    /// Vendor DataTransfer keyed by a vendor message id
    pub fn data_transfer(vendor_id: &str, message_id: &str, data: Value) -> Result<Self, OcppError> {
        Self::new(
            Action::DataTransfer,
            DataTransferRequest {
                vendor_id: vendor_id.to_string(),
                message_id: Some(message_id.to_string()),
                data: Some(data),
            },
        )
    }

    pub fn firmware_status(status: FirmwareStatus) -> Result<Self, OcppError> {
        Self::new(
            Action::FirmwareStatusNotification,
            FirmwareStatusNotificationRequest { status },
        )
    }

    /// Parse the payload as a specific request type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            self.action.to_string(),
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Reply with `{"status": ...}`
    pub fn status(message_id: impl Into<String>, status: ResponseStatus) -> Result<Self, OcppError> {
        Self::new(message_id, StatusResponse { status })
    }

    /// Reply with an empty object payload
    pub fn empty(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
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
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            format!("{:?}", self.error_code),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

impl From<CallError> for OcppError {
    fn from(error: CallError) -> Self {
        OcppError::Remote {
            code: error.error_code,
            description: error.error_description,
            details: error.error_details,
        }
    }
}

/// Any OCPP message
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from a text frame
    pub fn parse(text: &str) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_str(text)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(OcppError::InvalidFormat)?;

        let message_id = array
            .get(1)
            .and_then(Value::as_str)
            .ok_or(OcppError::InvalidFormat)?
            .to_string();

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }
                let action = array[2].as_str().ok_or(OcppError::InvalidFormat)?;

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action: Action::from(action),
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }
                let error_code = array[2]
                    .as_str()
                    .and_then(|code| serde_json::from_value(Value::String(code.to_string())).ok())
                    .unwrap_or(ErrorCode::GenericError);

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description: array[3].as_str().unwrap_or("").to_string(),
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn to_text(&self) -> Result<String, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_text(),
            OcppMessage::CallResult(r) => r.to_text(),
            OcppMessage::CallError(e) => e.to_text(),
        }
    }

    /// Unwrap a reply into its CallResult payload; a CallError becomes
    /// [`OcppError::Remote`].
    pub fn into_result_payload(self) -> Result<Value, OcppError> {
        match self {
            OcppMessage::CallResult(result) => Ok(result.payload),
            OcppMessage::CallError(error) => Err(error.into()),
            OcppMessage::Call(call) => Err(OcppError::UnexpectedReply(call.action.to_string())),
        }
    }
}
