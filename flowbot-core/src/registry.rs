//! Bot registry.
//!
//! Multiplexes many bots in one process, keyed by id and by token. The
//! registry owns every runtime; replacing or removing a bot stops its
//! polling loop. All three internal maps are updated under one lock, so
//! registrations never interleave partially.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::messages::MessageTable;
use crate::options::{BotOptions, NormalizedBotOptions, normalize_bot_options};
use crate::runtime::{BotRuntime, NavigateOptions, RuntimeError};
use crate::transport::{Transport, TransportFactory};

/// Errors surfaced by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No id could be derived from the declaration.
    #[error("unable to resolve a bot id: provide id, slug, or token")]
    BotIdUnresolved,

    /// The addressed bot is not registered.
    #[error("bot '{0}' is not registered")]
    BotNotFound(String),

    /// A runtime operation failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Default)]
struct RegistryInner {
    runtimes: HashMap<String, Arc<BotRuntime>>,
    /// token -> id. Exactly one runtime per token.
    tokens: HashMap<String, String>,
    options: HashMap<String, NormalizedBotOptions>,
}

/// Process-wide bot registry. Constructed explicitly with a transport
/// factory and passed to higher layers; never a singleton.
pub struct BotRegistry {
    factory: Arc<dyn TransportFactory>,
    messages: Arc<MessageTable>,
    inner: Mutex<RegistryInner>,
}

impl BotRegistry {
    /// Create a registry with the default message table.
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_messages(factory, Arc::new(MessageTable::default()))
    }

    /// Create a registry with an operator-supplied message table.
    pub fn with_messages(factory: Arc<dyn TransportFactory>, messages: Arc<MessageTable>) -> Self {
        Self {
            factory,
            messages,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Normalize and register one bot. Returns the resolved bot id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::BotIdUnresolved`] when no id can be derived.
    pub async fn register_bot(&self, options: BotOptions) -> Result<String, RegistryError> {
        let normalized = normalize_bot_options(options, None).inspect_err(|_| {
            tracing::error!("{}", self.messages.bot_id_resolution_failed);
        })?;
        Ok(self.register_normalized(normalized).await)
    }

    /// Register a batch; the position in the batch backs `bot-<index>` ids.
    ///
    /// # Errors
    ///
    /// Returns the first normalization failure; earlier bots in the batch
    /// stay registered.
    pub async fn register_bots(
        &self,
        batch: Vec<BotOptions>,
    ) -> Result<Vec<String>, RegistryError> {
        let mut ids = Vec::with_capacity(batch.len());
        for (index, options) in batch.into_iter().enumerate() {
            let normalized = normalize_bot_options(options, Some(index)).inspect_err(|_| {
                tracing::error!("{}", self.messages.bot_id_resolution_failed);
            })?;
            ids.push(self.register_normalized(normalized).await);
        }
        Ok(ids)
    }

    /// Register an already-normalized declaration.
    ///
    /// An existing runtime under the same id is replaced; a runtime holding
    /// the same token under another id is evicted first. Either way the old
    /// runtime's polling is stopped.
    pub async fn register_normalized(&self, normalized: NormalizedBotOptions) -> String {
        let mut inner = self.inner.lock().await;
        let id = normalized.id.clone();

        if inner.runtimes.contains_key(&id) {
            tracing::warn!("Bot '{}' is already registered; replacing it", id);
            Self::remove_locked(&mut inner, &id).await;
        }

        if let Some(holder) = inner.tokens.get(&normalized.token).cloned()
            && holder != id
        {
            tracing::warn!(
                "Token for bot '{}' is already held by '{}'; evicting the holder",
                id,
                holder
            );
            Self::remove_locked(&mut inner, &holder).await;
        }

        let runtime = BotRuntime::new(
            normalized.clone(),
            self.factory.as_ref(),
            Arc::clone(&self.messages),
        );

        inner.tokens.insert(normalized.token.clone(), id.clone());
        inner.options.insert(id.clone(), normalized);
        inner.runtimes.insert(id.clone(), runtime);
        id
    }

    async fn remove_locked(inner: &mut RegistryInner, id: &str) -> bool {
        let Some(runtime) = inner.runtimes.remove(id) else {
            return false;
        };
        inner.options.remove(id);
        inner.tokens.retain(|_, holder| holder != id);
        // Stop-polling failures are logged by the runtime and never block
        // cleanup; the maps above are already consistent.
        runtime.stop().await;
        true
    }

    /// Remove a bot and stop its polling. Returns whether it existed.
    pub async fn remove_bot(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        Self::remove_locked(&mut inner, id).await
    }

    /// The runtime registered under `id`.
    pub async fn get_bot_runtime(&self, id: &str) -> Option<Arc<BotRuntime>> {
        self.inner.lock().await.runtimes.get(id).cloned()
    }

    /// The transport client of the bot registered under `id`.
    pub async fn get_bot_instance(&self, id: &str) -> Option<Arc<dyn Transport>> {
        self.inner
            .lock()
            .await
            .runtimes
            .get(id)
            .map(|runtime| runtime.transport())
    }

    /// A copy of the stored declaration for `id`. Collections are fresh
    /// instances; mutating them does not affect the registry.
    pub async fn get_bot_options(&self, id: &str) -> Option<NormalizedBotOptions> {
        self.inner.lock().await.options.get(id).cloned()
    }

    /// Copies of every stored declaration.
    pub async fn list_registered_bots(&self) -> Vec<NormalizedBotOptions> {
        self.inner.lock().await.options.values().cloned().collect()
    }

    /// Every registered bot id.
    pub async fn get_registered_bot_ids(&self) -> Vec<String> {
        self.inner.lock().await.runtimes.keys().cloned().collect()
    }

    /// Drive a chat of a registered bot to a page.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::BotNotFound`] for an unknown bot, or the
    /// runtime's navigation failure.
    pub async fn go_to_page(
        &self,
        bot_id: &str,
        chat_id: &str,
        page_id: &str,
        options: NavigateOptions,
    ) -> Result<(), RegistryError> {
        let runtime = self
            .get_bot_runtime(bot_id)
            .await
            .ok_or_else(|| RegistryError::BotNotFound(bot_id.to_string()))?;
        runtime.go_to_page(chat_id, page_id, options).await?;
        Ok(())
    }

    /// Drive a chat of a registered bot to its initial page.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::BotNotFound`] for an unknown bot, or the
    /// runtime's navigation failure.
    pub async fn go_to_initial_page(
        &self,
        bot_id: &str,
        chat_id: &str,
        options: NavigateOptions,
    ) -> Result<(), RegistryError> {
        let runtime = self
            .get_bot_runtime(bot_id)
            .await
            .ok_or_else(|| RegistryError::BotNotFound(bot_id.to_string()))?;
        runtime.go_to_initial_page(chat_id, options).await?;
        Ok(())
    }

    /// Remove every bot, stopping all polling loops.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        let ids: Vec<String> = inner.runtimes.keys().cloned().collect();
        for id in ids {
            Self::remove_locked(&mut inner, &id).await;
        }
    }
}
