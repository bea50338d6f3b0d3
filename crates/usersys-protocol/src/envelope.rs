use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PayloadError, ProtocolError};
use crate::frame::{decode_frame, encode_frame};

/// Message types understood by the user service (wire values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Login = 1,
    GetProfile = 2,
    UpdateProfile = 3,
    Logout = 4,
    Heartbeat = 5,
}

impl MessageType {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Login),
            2 => Some(Self::GetProfile),
            3 => Some(Self::UpdateProfile),
            4 => Some(Self::Logout),
            5 => Some(Self::Heartbeat),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::GetProfile => "GET_PROFILE",
            Self::UpdateProfile => "UPDATE_PROFILE",
            Self::Logout => "LOGOUT",
            Self::Heartbeat => "HEARTBEAT",
        }
    }
}

/// Call outcome. Serialized as `0` (success) or `1` (error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Status {
    Success,
    Error,
}

impl From<Status> for u32 {
    fn from(status: Status) -> u32 {
        match status {
            Status::Success => 0,
            Status::Error => 1,
        }
    }
}

impl TryFrom<u32> for Status {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, String> {
        match value {
            0 => Ok(Status::Success),
            1 => Ok(Status::Error),
            other => Err(format!("unknown status {}", other)),
        }
    }
}

/// End-user messages carried by ERROR responses.
pub mod reason {
    /// Unknown username or wrong password. Deliberately the same for both.
    pub const INVALID_CREDENTIALS: &str = "invalid credentials";
    /// Token absent, expired or logged out.
    pub const INVALID_SESSION: &str = "invalid session";
    pub const INVALID_REQUEST_FORMAT: &str = "invalid request format";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "unknown message type";
    /// The frame arrived intact but its body was not an envelope.
    pub const MALFORMED_MESSAGE: &str = "malformed message";
}

/// Request envelope.
///
/// `kind` stays a raw `u32` so an unknown type survives decoding and can be
/// answered with an ERROR response instead of a dropped connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: u32,
    pub id: u32,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(kind: MessageType, id: u32, payload: Value) -> Self {
        Self {
            kind: kind.as_wire(),
            id,
            payload,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_wire(self.kind)
    }

    /// Serialize and frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = serde_json::to_vec(self).map_err(PayloadError::from)?;
        Ok(encode_frame(&body)?)
    }

    /// Parse the first frame in `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self::from_body(decode_frame(bytes)?)?)
    }

    /// Parse an already de-framed body.
    pub fn from_body(body: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Response envelope. `payload` is `null` unless a SUCCESS reply carries
/// data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: u32,
    pub id: u32,
    pub status: Status,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    pub fn success(kind: u32, id: u32, message: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            id,
            status: Status::Success,
            message: message.into(),
            payload,
        }
    }

    pub fn error(kind: u32, id: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            status: Status::Error,
            message: message.into(),
            payload: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = serde_json::to_vec(self).map_err(PayloadError::from)?;
        Ok(encode_frame(&body)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self::from_body(decode_frame(bytes)?)?)
    }

    pub fn from_body(body: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(body)?)
    }
}
