//! Transport port for chat platforms.
//!
//! The runtime never talks to a wire protocol directly; it consumes a
//! [`Transport`] capability that can send messages, register event listeners,
//! and stop its polling loop. Adapters (and the [`mock`] backend used in
//! tests) implement this port.

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::IncomingMessage;

/// Errors that can occur at the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A message could not be delivered.
    #[error("send failed for chat {chat_id}: {reason}")]
    Send {
        /// Chat the send was addressed to.
        chat_id: String,
        /// Adapter-reported failure description.
        reason: String,
    },

    /// Stopping the polling loop failed.
    #[error("stop polling failed: {0}")]
    Stop(String),
}

/// Well-known transport event names.
pub mod event {
    /// A new inbound chat message.
    pub const MESSAGE: &str = "message";
    /// An edit to a previously sent message.
    pub const EDITED_MESSAGE: &str = "edited_message";
    /// An inline-keyboard button tap.
    pub const CALLBACK_QUERY: &str = "callback_query";
}

/// Text formatting mode for outgoing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    Html,
    Markdown,
    MarkdownV2,
}

/// One button of an inline keyboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineButton {
    /// Button label.
    pub text: String,
    /// Callback data delivered on tap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    /// URL opened on tap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl InlineButton {
    /// A button that fires a callback query with `data`.
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: Some(data.into()),
            url: None,
        }
    }

    /// A button that opens a URL.
    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: None,
            url: Some(url.into()),
        }
    }
}

/// A reply keyboard shown under the input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyKeyboard {
    /// Button labels, row by row.
    pub rows: Vec<Vec<String>>,
    /// Shrink the keyboard to fit its buttons.
    #[serde(default)]
    pub resize: bool,
    /// Hide the keyboard after one use.
    #[serde(default)]
    pub one_time: bool,
}

/// Reply markup attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "markup")]
pub enum ReplyMarkup {
    /// Inline keyboard attached to the message.
    Inline(Vec<Vec<InlineButton>>),
    /// Reply keyboard shown under the input field.
    Keyboard(ReplyKeyboard),
    /// Remove any visible reply keyboard.
    Remove,
}

/// Options for an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<ParseMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<ReplyMarkup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_web_page_preview: Option<bool>,
}

/// Payload delivered to event listeners.
#[derive(Debug, Clone)]
pub struct EventPayload {
    /// Event name (see [`event`]).
    pub event: String,
    /// The normalized message, for message-shaped events.
    pub message: Option<IncomingMessage>,
    /// The raw platform payload for everything else.
    pub data: Value,
}

impl EventPayload {
    /// Build a `message` event payload.
    pub fn message(message: IncomingMessage) -> Self {
        Self {
            event: event::MESSAGE.to_string(),
            message: Some(message),
            data: Value::Null,
        }
    }
}

/// An async event listener registered on a transport.
pub type EventListener = Arc<dyn Fn(EventPayload) -> BoxFuture<'static, ()> + Send + Sync>;

/// Port to the chat platform's wire client.
///
/// One runtime exclusively owns one transport; all sends go through it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a text message to a chat.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Send`] when the platform rejects the send.
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<(), TransportError>;

    /// Register a listener for a named transport event.
    ///
    /// Listeners for the same event are invoked in registration order.
    fn on(&self, event: &str, listener: EventListener);

    /// Stop the long-polling loop. Cooperative: in-flight callbacks finish.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Stop`] when shutdown fails; callers log and
    /// proceed with cleanup.
    async fn stop_polling(&self) -> Result<(), TransportError>;
}

/// Factory creating a transport from a bot token.
///
/// Injected into the registry so the runtime stays wire-agnostic.
pub trait TransportFactory: Send + Sync {
    /// Create a transport client for `token` with long polling enabled.
    fn create(&self, token: &str) -> Arc<dyn Transport>;
}
