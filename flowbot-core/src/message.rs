//! Incoming message types.
//!
//! Provides the transport-agnostic [`IncomingMessage`] model that adapters
//! build from their platform's update type. Field names mirror the Bot API
//! wire format so sessions and persisted values stay readable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The sender of a message, as reported by the chat platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramUser {
    /// Platform user id.
    pub id: i64,
    /// Optional @username handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// First name as set in the user's profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Last name as set in the user's profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// IETF language tag of the user's client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

impl TelegramUser {
    /// Create a user with only an id; profile fields default to `None`.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            username: None,
            first_name: None,
            last_name: None,
            language_code: None,
        }
    }
}

/// The chat a message arrived in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingChat {
    /// Platform chat id.
    pub id: i64,
}

/// A shared phone contact attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub phone_number: String,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

/// A shared location attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub longitude: f64,
    pub latitude: f64,
}

/// One size variant of a photo attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoSize {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u32>,
}

/// A document (file) attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAttachment {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u32>,
}

/// An inbound chat message, normalized from the transport's update type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    /// Platform message id.
    pub message_id: i64,
    /// The chat the message arrived in.
    pub chat: IncomingChat,
    /// The sender, when the platform reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TelegramUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<Vec<PhotoSize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentAttachment>,
}

impl IncomingMessage {
    /// Create a plain text message — the common case in tests and
    /// programmatic navigation.
    pub fn text(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            message_id: 0,
            chat: IncomingChat { id: chat_id },
            from: None,
            text: Some(text.into()),
            caption: None,
            contact: None,
            location: None,
            photo: None,
            document: None,
        }
    }

    /// Attach a sender to this message.
    pub fn with_from(mut self, from: TelegramUser) -> Self {
        self.from = Some(from);
        self
    }

    /// The chat id as the string key used by sessions and step states.
    pub fn chat_key(&self) -> String {
        self.chat.id.to_string()
    }

    /// The whole message as a JSON value — the extraction fallback when no
    /// recognized payload field is present.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
