use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::{Message, MessageType};
use crate::error::PayloadError;

// -- Request payloads --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Payload of GET_PROFILE and LOGOUT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProfileRequest {
    pub token: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub profile_pic: String,
}

// -- Reply payloads --

/// Public view of a user. Never carries the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub nickname: String,
    pub profile_pic: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginReply {
    pub token: String,
    pub user: UserProfile,
}

/// Reply to GET_PROFILE and UPDATE_PROFILE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileReply {
    pub user: UserProfile,
}

// -- Typed request --

/// A decoded request. The envelope's `type` picks the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Login(LoginRequest),
    GetProfile(TokenRequest),
    UpdateProfile(UpdateProfileRequest),
    Logout(TokenRequest),
    Heartbeat,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("invalid {} payload: {source}", .kind.name())]
    InvalidPayload {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Login(_) => MessageType::Login,
            Self::GetProfile(_) => MessageType::GetProfile,
            Self::UpdateProfile(_) => MessageType::UpdateProfile,
            Self::Logout(_) => MessageType::Logout,
            Self::Heartbeat => MessageType::Heartbeat,
        }
    }

    /// Decode the payload shape selected by `message.kind`.
    ///
    /// HEARTBEAT ignores whatever payload it was sent.
    pub fn from_message(message: &Message) -> Result<Self, RequestError> {
        let kind = message
            .message_type()
            .ok_or(RequestError::UnknownType(message.kind))?;

        Ok(match kind {
            MessageType::Login => Self::Login(parse(kind, &message.payload)?),
            MessageType::GetProfile => Self::GetProfile(parse(kind, &message.payload)?),
            MessageType::UpdateProfile => Self::UpdateProfile(parse(kind, &message.payload)?),
            MessageType::Logout => Self::Logout(parse(kind, &message.payload)?),
            MessageType::Heartbeat => Self::Heartbeat,
        })
    }

    /// Wrap into an envelope carrying `id`.
    pub fn into_message(self, id: u32) -> Result<Message, PayloadError> {
        let kind = self.message_type();
        let payload = match self {
            Self::Login(req) => serde_json::to_value(req)?,
            Self::GetProfile(req) | Self::Logout(req) => serde_json::to_value(req)?,
            Self::UpdateProfile(req) => serde_json::to_value(req)?,
            Self::Heartbeat => Value::Null,
        };
        Ok(Message::new(kind, id, payload))
    }
}

fn parse<T: DeserializeOwned>(kind: MessageType, payload: &Value) -> Result<T, RequestError> {
    T::deserialize(payload).map_err(|source| RequestError::InvalidPayload { kind, source })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_login() {
        let msg = Message::new(
            MessageType::Login,
            1,
            json!({"username": "alice", "password": "secret"}),
        );
        assert_eq!(
            Request::from_message(&msg).unwrap(),
            Request::Login(LoginRequest {
                username: "alice".into(),
                password: "secret".into(),
            })
        );
    }

    #[test]
    fn update_profile_fields_default_to_empty() {
        let msg = Message::new(MessageType::UpdateProfile, 1, json!({"token": "t"}));
        assert_eq!(
            Request::from_message(&msg).unwrap(),
            Request::UpdateProfile(UpdateProfileRequest {
                token: "t".into(),
                nickname: String::new(),
                profile_pic: String::new(),
            })
        );
    }

    #[test]
    fn heartbeat_ignores_payload() {
        let msg = Message::new(MessageType::Heartbeat, 1, json!([1, 2, 3]));
        assert_eq!(Request::from_message(&msg).unwrap(), Request::Heartbeat);
    }

    #[test]
    fn missing_token_is_invalid_payload() {
        let msg = Message::new(MessageType::GetProfile, 1, json!({"tok": "x"}));
        assert!(matches!(
            Request::from_message(&msg),
            Err(RequestError::InvalidPayload {
                kind: MessageType::GetProfile,
                ..
            })
        ));
    }

    #[test]
    fn unknown_type_is_reported() {
        let msg = Message {
            kind: 99,
            id: 1,
            payload: Value::Null,
        };
        assert!(matches!(
            Request::from_message(&msg),
            Err(RequestError::UnknownType(99))
        ));
    }

    #[test]
    fn into_message_is_inverse_of_from_message() {
        let req = Request::Logout(TokenRequest { token: "abc".into() });
        let msg = req.clone().into_message(12).unwrap();
        assert_eq!(msg.kind, 4);
        assert_eq!(msg.id, 12);
        assert_eq!(Request::from_message(&msg).unwrap(), req);
    }

    #[test]
    fn profile_uses_snake_case_field_names() {
        let value = serde_json::to_value(UpdateProfileRequest {
            token: "t".into(),
            nickname: "n".into(),
            profile_pic: "p".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"token": "t", "nickname": "n", "profile_pic": "p"}));
    }
}
