//! Teloxide-backed implementation of the core transport port.
//!
//! One [`TeloxideTransport`] wraps one `teloxide::Bot` with a long-polling
//! loop. Inbound updates are converted into the core message model and
//! fanned out to the listeners registered through `on`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup, KeyboardRemove,
    LinkPreviewOptions, UpdateKind,
};
use teloxide::update_listeners::{AsUpdateStream, polling_default};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use flowbot_core::message::{
    Contact, DocumentAttachment, IncomingChat, IncomingMessage, Location, PhotoSize, TelegramUser,
};
use flowbot_core::transport::{
    EventListener, EventPayload, ParseMode, ReplyMarkup, SendOptions, Transport, TransportError,
    TransportFactory, event,
};

/// Transport adapter over a teloxide `Bot` with long polling.
pub struct TeloxideTransport {
    bot: Bot,
    listeners: StdMutex<HashMap<String, Vec<EventListener>>>,
    polling: StdMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl TeloxideTransport {
    /// Create a transport for the given bot token. Polling starts when
    /// [`TeloxideTransport::start_polling`] is called (the factory does so).
    pub fn new(token: &str) -> Arc<Self> {
        Arc::new(Self {
            bot: Bot::new(token),
            listeners: StdMutex::new(HashMap::new()),
            polling: StdMutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// The wrapped teloxide client, for calls outside the port.
    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    /// Spawn the long-polling loop. Idempotent.
    pub fn start_polling(self: &Arc<Self>) {
        let mut polling = self.polling.lock().expect("polling lock poisoned");
        if polling.is_some() {
            return;
        }
        let transport = Arc::clone(self);
        *polling = Some(tokio::spawn(async move {
            transport.run_polling().await;
        }));
    }

    async fn run_polling(self: Arc<Self>) {
        let mut listener = polling_default(self.bot.clone()).await;
        let stream = listener.as_stream();
        tokio::pin!(stream);

        tracing::info!("Long polling started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                update = stream.next() => match update {
                    Some(Ok(update)) => self.dispatch(update).await,
                    Some(Err(error)) => {
                        tracing::warn!("Polling error: {}", error);
                    }
                    None => break,
                },
            }
        }
        tracing::info!("Long polling stopped");
    }

    async fn dispatch(&self, update: Update) {
        match update.kind {
            UpdateKind::Message(message) => {
                self.emit(EventPayload::message(convert_message(&message)))
                    .await;
            }
            UpdateKind::EditedMessage(message) => {
                self.emit(EventPayload {
                    event: event::EDITED_MESSAGE.to_string(),
                    message: Some(convert_message(&message)),
                    data: Value::Null,
                })
                .await;
            }
            UpdateKind::CallbackQuery(query) => {
                self.emit(EventPayload {
                    event: event::CALLBACK_QUERY.to_string(),
                    message: None,
                    data: serde_json::to_value(&query).unwrap_or(Value::Null),
                })
                .await;
            }
            other => {
                tracing::debug!("Ignoring unhandled update kind: {:?}", other);
            }
        }
    }

    async fn emit(&self, payload: EventPayload) {
        let listeners: Vec<EventListener> = {
            let map = self.listeners.lock().expect("listener lock poisoned");
            map.get(&payload.event).cloned().unwrap_or_default()
        };
        for listener in listeners {
            listener(payload.clone()).await;
        }
    }
}

#[async_trait]
impl Transport for TeloxideTransport {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        let id: i64 = chat_id.parse().map_err(|_| TransportError::Send {
            chat_id: chat_id.to_string(),
            reason: "chat id is not numeric".to_string(),
        })?;

        let mut request = self.bot.send_message(ChatId(id), text);
        if let Some(mode) = options.parse_mode {
            request = request.parse_mode(to_teloxide_parse_mode(mode));
        }
        if let Some(markup) = options.reply_markup {
            request = request.reply_markup(to_teloxide_markup(markup));
        }
        if options.disable_web_page_preview == Some(true) {
            request = request.link_preview_options(LinkPreviewOptions {
                is_disabled: true,
                url: None,
                prefer_small_media: false,
                prefer_large_media: false,
                show_above_text: false,
            });
        }

        request
            .await
            .map(|_| ())
            .map_err(|error| TransportError::Send {
                chat_id: chat_id.to_string(),
                reason: error.to_string(),
            })
    }

    fn on(&self, event: &str, listener: EventListener) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    async fn stop_polling(&self) -> Result<(), TransportError> {
        self.cancel.cancel();
        let handle = self.polling.lock().expect("polling lock poisoned").take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|error| TransportError::Stop(error.to_string()))?;
        }
        Ok(())
    }
}

/// Factory handing out polling [`TeloxideTransport`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeloxideTransportFactory;

impl TransportFactory for TeloxideTransportFactory {
    fn create(&self, token: &str) -> Arc<dyn Transport> {
        let transport = TeloxideTransport::new(token);
        transport.start_polling();
        transport
    }
}

fn to_teloxide_parse_mode(mode: ParseMode) -> teloxide::types::ParseMode {
    match mode {
        ParseMode::Html => teloxide::types::ParseMode::Html,
        ParseMode::Markdown => teloxide::types::ParseMode::Markdown,
        ParseMode::MarkdownV2 => teloxide::types::ParseMode::MarkdownV2,
    }
}

fn to_teloxide_markup(markup: ReplyMarkup) -> teloxide::types::ReplyMarkup {
    match markup {
        ReplyMarkup::Inline(rows) => {
            let keyboard: Vec<Vec<InlineKeyboardButton>> = rows
                .into_iter()
                .map(|row| row.into_iter().filter_map(to_inline_button).collect())
                .collect();
            teloxide::types::ReplyMarkup::InlineKeyboard(InlineKeyboardMarkup::new(keyboard))
        }
        ReplyMarkup::Keyboard(keyboard) => {
            let rows: Vec<Vec<KeyboardButton>> = keyboard
                .rows
                .into_iter()
                .map(|row| row.into_iter().map(KeyboardButton::new).collect())
                .collect();
            let mut markup = KeyboardMarkup::new(rows);
            if keyboard.resize {
                markup = markup.resize_keyboard();
            }
            if keyboard.one_time {
                markup = markup.one_time_keyboard();
            }
            teloxide::types::ReplyMarkup::Keyboard(markup)
        }
        ReplyMarkup::Remove => {
            teloxide::types::ReplyMarkup::KeyboardRemove(KeyboardRemove::new())
        }
    }
}

fn to_inline_button(
    button: flowbot_core::transport::InlineButton,
) -> Option<InlineKeyboardButton> {
    if let Some(data) = button.callback_data {
        return Some(InlineKeyboardButton::callback(button.text, data));
    }
    if let Some(url) = button.url {
        return match Url::parse(&url) {
            Ok(parsed) => Some(InlineKeyboardButton::url(button.text, parsed)),
            Err(error) => {
                tracing::warn!("Dropping button with invalid url '{}': {}", url, error);
                None
            }
        };
    }
    tracing::warn!("Dropping inline button '{}' without an action", button.text);
    None
}

/// Convert a teloxide message into the core model.
pub fn convert_message(message: &teloxide::types::Message) -> IncomingMessage {
    IncomingMessage {
        message_id: i64::from(message.id.0),
        chat: IncomingChat {
            id: message.chat.id.0,
        },
        from: message.from.as_ref().map(convert_user),
        text: message.text().map(str::to_string),
        caption: message.caption().map(str::to_string),
        contact: message.contact().map(|c| Contact {
            phone_number: c.phone_number.clone(),
            first_name: c.first_name.clone(),
            last_name: c.last_name.clone(),
            user_id: c.user_id.map(|id| id.0 as i64),
        }),
        location: message.location().map(|l| Location {
            longitude: l.longitude,
            latitude: l.latitude,
        }),
        photo: message.photo().map(|sizes| {
            sizes
                .iter()
                .map(|p| PhotoSize {
                    file_id: p.file.id.0.clone(),
                    width: p.width,
                    height: p.height,
                    file_size: Some(p.file.size),
                })
                .collect()
        }),
        document: message.document().map(|d| DocumentAttachment {
            file_id: d.file.id.0.clone(),
            file_name: d.file_name.clone(),
            mime_type: d.mime_type.as_ref().map(|m| m.to_string()),
            file_size: Some(d.file.size),
        }),
    }
}

fn convert_user(user: &teloxide::types::User) -> TelegramUser {
    TelegramUser {
        id: user.id.0 as i64,
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
        language_code: user.language_code.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use flowbot_core::transport::{InlineButton, ReplyKeyboard};

    fn tg_message(extra: Value) -> teloxide::types::Message {
        let mut base = json!({
            "message_id": 11,
            "date": 1700000000,
            "chat": {"id": 42, "type": "private", "first_name": "Ann"},
            "from": {
                "id": 10,
                "is_bot": false,
                "first_name": "Ann",
                "username": "ann",
                "language_code": "en"
            }
        });
        base.as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(base).expect("message json should deserialize")
    }

    #[test]
    fn test_convert_text_message() {
        let message = tg_message(json!({"text": "hello"}));
        let converted = convert_message(&message);

        assert_eq!(converted.message_id, 11);
        assert_eq!(converted.chat.id, 42);
        assert_eq!(converted.text.as_deref(), Some("hello"));
        let from = converted.from.expect("sender");
        assert_eq!(from.id, 10);
        assert_eq!(from.username.as_deref(), Some("ann"));
        assert_eq!(from.first_name.as_deref(), Some("Ann"));
        assert_eq!(from.language_code.as_deref(), Some("en"));
    }

    #[test]
    fn test_convert_contact_message() {
        let message = tg_message(json!({
            "contact": {"phone_number": "+100200", "first_name": "Bob", "user_id": 77}
        }));
        let converted = convert_message(&message);
        let contact = converted.contact.expect("contact");
        assert_eq!(contact.phone_number, "+100200");
        assert_eq!(contact.first_name, "Bob");
        assert_eq!(contact.user_id, Some(77));
        assert!(converted.text.is_none());
    }

    #[test]
    fn test_convert_location_message() {
        let message = tg_message(json!({
            "location": {"longitude": 13.4, "latitude": 52.5}
        }));
        let converted = convert_message(&message);
        let location = converted.location.expect("location");
        assert_eq!(location.longitude, 13.4);
        assert_eq!(location.latitude, 52.5);
    }

    #[test]
    fn test_convert_photo_with_caption() {
        let message = tg_message(json!({
            "caption": "look",
            "photo": [
                {"file_id": "f-small", "file_unique_id": "u1", "file_size": 100, "width": 90, "height": 60},
                {"file_id": "f-big", "file_unique_id": "u2", "file_size": 500, "width": 900, "height": 600}
            ]
        }));
        let converted = convert_message(&message);
        assert_eq!(converted.caption.as_deref(), Some("look"));
        let photo = converted.photo.expect("photo");
        assert_eq!(photo.len(), 2);
        assert_eq!(photo[0].file_id, "f-small");
        assert_eq!(photo[1].width, 900);
    }

    #[test]
    fn test_parse_mode_conversion() {
        assert_eq!(
            to_teloxide_parse_mode(ParseMode::Html),
            teloxide::types::ParseMode::Html
        );
        assert_eq!(
            to_teloxide_parse_mode(ParseMode::MarkdownV2),
            teloxide::types::ParseMode::MarkdownV2
        );
    }

    #[test]
    fn test_inline_markup_conversion() {
        let markup = ReplyMarkup::Inline(vec![vec![
            InlineButton::callback("Pick", "pick:1"),
            InlineButton::url("Site", "https://example.com"),
        ]]);
        let converted = to_teloxide_markup(markup);
        let value = serde_json::to_value(&converted).expect("serialize");
        let rows = value["inline_keyboard"].as_array().expect("rows");
        assert_eq!(rows[0][0]["text"], "Pick");
        assert_eq!(rows[0][0]["callback_data"], "pick:1");
        assert_eq!(rows[0][1]["text"], "Site");
        assert_eq!(rows[0][1]["url"], "https://example.com/");
    }

    #[test]
    fn test_inline_button_without_action_is_dropped() {
        let markup = ReplyMarkup::Inline(vec![vec![InlineButton {
            text: "dead".to_string(),
            callback_data: None,
            url: None,
        }]]);
        let converted = to_teloxide_markup(markup);
        let value = serde_json::to_value(&converted).expect("serialize");
        assert_eq!(value["inline_keyboard"][0].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_reply_keyboard_conversion() {
        let markup = ReplyMarkup::Keyboard(ReplyKeyboard {
            rows: vec![vec!["Yes".to_string(), "No".to_string()]],
            resize: true,
            one_time: true,
        });
        let converted = to_teloxide_markup(markup);
        let value = serde_json::to_value(&converted).expect("serialize");
        assert_eq!(value["keyboard"][0][0]["text"], "Yes");
        assert_eq!(value["resize_keyboard"], true);
        assert_eq!(value["one_time_keyboard"], true);
    }

    #[test]
    fn test_remove_markup_conversion() {
        let converted = to_teloxide_markup(ReplyMarkup::Remove);
        let value = serde_json::to_value(&converted).expect("serialize");
        assert_eq!(value["remove_keyboard"], true);
    }
}
