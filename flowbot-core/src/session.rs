//! Per-chat session state and the session manager.
//!
//! A [`SessionManager`] is a read-through, write-through cache over a
//! pluggable [`SessionStorage`] backend. The storage side exchanges raw JSON
//! so that states written by earlier deployments (legacy bare data maps)
//! survive and are normalized on read.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::message::TelegramUser;

/// Errors that can occur during session storage operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The backing store failed.
    #[error("session storage error: {0}")]
    Backend(String),

    /// The cached or stored state could not be serialized.
    #[error("session state serialization failed: {0}")]
    Serialize(String),
}

/// Conversation state for one chat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSessionState {
    /// The page the chat currently sits on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    /// Per-page answers plus user-defined session slots. Never null.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// The chat's user, once seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<TelegramUser>,
}

impl ChatSessionState {
    /// Fresh state: no page, empty data.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Port for session storage backends.
///
/// `get` returns the raw stored JSON; normalization happens in the manager
/// so every backend benefits from it. `delete` defaults to a no-op for
/// backends that cannot remove entries.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Load the raw stored state for a chat, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Backend`] when the store fails.
    async fn get(&self, chat_id: &str) -> Result<Option<Value>, SessionError>;

    /// Store the state for a chat, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Backend`] when the store fails.
    async fn set(&self, chat_id: &str, state: Value) -> Result<(), SessionError>;

    /// Remove the stored state for a chat. Backends without deletion
    /// support inherit this no-op.
    async fn delete(&self, _chat_id: &str) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Default in-memory storage backend.
#[derive(Default)]
pub struct MemorySessionStorage {
    states: Mutex<HashMap<String, Value>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for MemorySessionStorage {
    async fn get(&self, chat_id: &str) -> Result<Option<Value>, SessionError> {
        Ok(self.states.lock().await.get(chat_id).cloned())
    }

    async fn set(&self, chat_id: &str, state: Value) -> Result<(), SessionError> {
        self.states.lock().await.insert(chat_id.to_string(), state);
        Ok(())
    }

    async fn delete(&self, chat_id: &str) -> Result<(), SessionError> {
        self.states.lock().await.remove(chat_id);
        Ok(())
    }
}

/// Normalize a raw stored value into a [`ChatSessionState`].
///
/// Already-normalized predicate: a non-array object carrying a `data` key of
/// non-array type. A nullish `data` becomes `{}`. Any other object is a
/// legacy bare data map and is lifted into `{page_id: None, data: map}`.
/// Arrays and non-objects are rejected to a fresh state.
pub fn normalize_session_value(raw: Value) -> ChatSessionState {
    let Value::Object(map) = raw else {
        return ChatSessionState::empty();
    };

    let already_normalized = matches!(
        map.get("data"),
        Some(value) if !value.is_array()
    );

    if already_normalized {
        let page_id = map
            .get("pageId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let data = match map.get("data") {
            Some(Value::Object(data)) => data.clone(),
            _ => Map::new(),
        };
        let user = map
            .get("user")
            .cloned()
            .and_then(|u| serde_json::from_value(u).ok());
        return ChatSessionState {
            page_id,
            data,
            user,
        };
    }

    // Legacy shape: the whole object is the data map.
    ChatSessionState {
        page_id: None,
        data: map,
        user: None,
    }
}

/// Read-through, write-through session cache over a storage backend.
///
/// Cached entries are authoritative for the lifetime of the process; the
/// backend is the source of truth across restarts. When a save reaches the
/// cache but the backend write fails, the cache keeps the new value and the
/// caller sees the error — the next cold load refreshes from the backend
/// (eventually consistent on restart).
pub struct SessionManager {
    cache: Mutex<HashMap<String, ChatSessionState>>,
    storage: Arc<dyn SessionStorage>,
}

impl SessionManager {
    /// Create a manager over the given backend.
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            storage,
        }
    }

    /// Get the session for a chat, loading and normalizing from storage on
    /// a cache miss. A chat with no stored state gets a fresh empty state.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Backend`] when the cold load fails.
    pub async fn get_session(&self, chat_id: &str) -> Result<ChatSessionState, SessionError> {
        if let Some(state) = self.cache.lock().await.get(chat_id) {
            return Ok(state.clone());
        }

        let state = match self.storage.get(chat_id).await? {
            Some(raw) => normalize_session_value(raw),
            None => ChatSessionState::empty(),
        };

        self.cache
            .lock()
            .await
            .insert(chat_id.to_string(), state.clone());
        Ok(state)
    }

    /// Save the session: cache first, then the backend. Both must succeed
    /// for the call to succeed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Backend`] when the backend write fails (the
    /// cache keeps the new value).
    pub async fn save_session(
        &self,
        chat_id: &str,
        state: &ChatSessionState,
    ) -> Result<(), SessionError> {
        self.cache
            .lock()
            .await
            .insert(chat_id.to_string(), state.clone());

        let raw =
            serde_json::to_value(state).map_err(|e| SessionError::Serialize(e.to_string()))?;
        self.storage.set(chat_id, raw).await
    }

    /// Evict the cache entry and forward the delete to the backend.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Backend`] when the backend delete fails.
    pub async fn delete_session(&self, chat_id: &str) -> Result<(), SessionError> {
        self.cache.lock().await.remove(chat_id);
        self.storage.delete(chat_id).await
    }
}
