//! The aggregate context passed to handlers and resolvers.
//!
//! A [`Context`] is built per processed event and handed to every
//! user-supplied callback: validators, content factories, side effects,
//! next resolvers, keyboards, and middlewares. It carries shared handles,
//! not closures, so callbacks stay plain `async fn`s.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::gateway::PersistenceGateway;
use crate::message::{IncomingMessage, TelegramUser};
use crate::transport::{SendOptions, Transport, TransportError};

/// Named opaque services injected at bot registration.
pub type Services = Arc<HashMap<String, Arc<dyn Any + Send + Sync>>>;

/// Shared view of a chat's session data for the duration of one step.
///
/// Every context built within a step holds the same handle, so a value set
/// by a side effect is visible to the next resolver and is mirrored back
/// into the session when the step completes.
#[derive(Clone, Default)]
pub struct SessionData {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl SessionData {
    /// Wrap an initial data map.
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data)),
        }
    }

    /// Clone of the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().expect("session data poisoned").get(key).cloned()
    }

    /// Store a value under `key`, replacing any previous one.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner
            .lock()
            .expect("session data poisoned")
            .insert(key.into(), value);
    }

    /// Remove the value stored under `key`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.lock().expect("session data poisoned").remove(key)
    }

    /// Copy of the full map.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.lock().expect("session data poisoned").clone()
    }
}

impl fmt::Debug for SessionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionData").field(&self.snapshot()).finish()
    }
}

/// Everything a callback can see about the event being processed.
#[derive(Clone)]
pub struct Context {
    /// Id of the bot handling the event.
    pub bot_id: String,
    /// The chat the event belongs to.
    pub chat_id: String,
    /// The transport client, for sending replies.
    pub transport: Arc<dyn Transport>,
    /// The inbound message, when the event carries one.
    pub message: Option<IncomingMessage>,
    /// Caller-supplied metadata for programmatic navigation.
    pub metadata: Option<Value>,
    /// Shared session data for this step.
    pub state: SessionData,
    /// The chat's user, once seen.
    pub user: Option<TelegramUser>,
    /// The persistence gateway, for callbacks that read or write records.
    pub persistence: Arc<dyn PersistenceGateway>,
    /// Named opaque services injected at registration.
    pub services: Services,
}

impl Context {
    /// Send a plain text reply to the context's chat.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Send`] when the platform rejects the send.
    pub async fn reply(&self, text: &str) -> Result<(), TransportError> {
        self.transport
            .send_message(&self.chat_id, text, SendOptions::default())
            .await
    }

    /// Look up a typed service by name.
    ///
    /// Returns `None` when the name is unknown or the stored service has a
    /// different type.
    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services
            .get(name)
            .cloned()
            .and_then(|s| s.downcast::<T>().ok())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("bot_id", &self.bot_id)
            .field("chat_id", &self.chat_id)
            .field("message", &self.message)
            .field("metadata", &self.metadata)
            .field("state", &self.state)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}
