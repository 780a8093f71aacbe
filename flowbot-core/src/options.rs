//! Bot declaration and normalization.
//!
//! A [`BotOptions`] bundle is everything one bot needs: token, page graph,
//! handlers, middlewares, keyboards, services, and optional storage and
//! database handles. The registry normalizes it before constructing a
//! runtime.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::middleware::{HandlerFn, MiddlewareConfig};
use crate::page::{Keyboard, Page, PageMiddlewareConfig};
use crate::registry::RegistryError;
use crate::session::SessionStorage;
use crate::store::Database;

/// Slug used when the declaration does not name one.
pub const DEFAULT_SLUG: &str = "default";

/// A transport event subscription with per-handler middlewares.
#[derive(Clone)]
pub struct Handler {
    /// Transport event name (see [`crate::transport::event`]).
    pub event: String,
    /// The listener; a handler without one is skipped with a warning.
    pub listener: Option<HandlerFn>,
    /// Middlewares wrapped around this listener only.
    pub middlewares: Vec<MiddlewareConfig>,
}

impl Handler {
    pub fn new(event: impl Into<String>, listener: HandlerFn) -> Self {
        Self {
            event: event.into(),
            listener: Some(listener),
            middlewares: Vec::new(),
        }
    }

    pub fn with_middleware(mut self, config: MiddlewareConfig) -> Self {
        self.middlewares.push(config);
        self
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("event", &self.event)
            .field("has_listener", &self.listener.is_some())
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

/// Declaration of one bot.
#[derive(Clone, Default)]
pub struct BotOptions {
    /// Unique bot id; derived from slug or token when absent.
    pub id: Option<String>,
    /// Bot API token. One runtime per token.
    pub token: String,
    /// Partition key for step states in shared tables.
    pub slug: Option<String>,
    /// Page the conversation starts on; defaults to the first page.
    pub initial_page_id: Option<String>,
    pub pages: Vec<Page>,
    pub handlers: Vec<Handler>,
    /// Middlewares wrapped around every handler.
    pub middlewares: Vec<MiddlewareConfig>,
    pub keyboards: Vec<Keyboard>,
    /// Named page middlewares referenced by pages.
    pub page_middlewares: Vec<PageMiddlewareConfig>,
    /// Named opaque services exposed through the context.
    pub services: HashMap<String, Arc<dyn Any + Send + Sync>>,
    /// Session backend; in-memory when absent.
    pub session_storage: Option<Arc<dyn SessionStorage>>,
    /// Database handle; persistence is a no-op when absent.
    pub database: Option<Arc<dyn Database>>,
}

impl BotOptions {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn with_initial_page(mut self, page_id: impl Into<String>) -> Self {
        self.initial_page_id = Some(page_id.into());
        self
    }

    pub fn with_page(mut self, page: Page) -> Self {
        self.pages.push(page);
        self
    }

    pub fn with_pages(mut self, pages: impl IntoIterator<Item = Page>) -> Self {
        self.pages.extend(pages);
        self
    }

    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_middleware(mut self, config: MiddlewareConfig) -> Self {
        self.middlewares.push(config);
        self
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboards.push(keyboard);
        self
    }

    pub fn with_page_middleware(mut self, config: PageMiddlewareConfig) -> Self {
        self.page_middlewares.push(config);
        self
    }

    pub fn with_service(
        mut self,
        name: impl Into<String>,
        service: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        self.services.insert(name.into(), service);
        self
    }

    pub fn with_session_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.session_storage = Some(storage);
        self
    }

    pub fn with_database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }
}

impl fmt::Debug for BotOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotOptions")
            .field("id", &self.id)
            .field("slug", &self.slug)
            .field("initial_page_id", &self.initial_page_id)
            .field("pages", &self.pages.len())
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

/// A bot declaration with id and slug resolved. What the registry stores.
#[derive(Clone)]
pub struct NormalizedBotOptions {
    pub id: String,
    pub token: String,
    pub slug: String,
    pub initial_page_id: Option<String>,
    pub pages: Vec<Page>,
    pub handlers: Vec<Handler>,
    pub middlewares: Vec<MiddlewareConfig>,
    pub keyboards: Vec<Keyboard>,
    pub page_middlewares: Vec<PageMiddlewareConfig>,
    pub services: HashMap<String, Arc<dyn Any + Send + Sync>>,
    pub session_storage: Option<Arc<dyn SessionStorage>>,
    pub database: Option<Arc<dyn Database>>,
}

impl fmt::Debug for NormalizedBotOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedBotOptions")
            .field("id", &self.id)
            .field("slug", &self.slug)
            .field("initial_page_id", &self.initial_page_id)
            .field("pages", &self.pages.len())
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

/// Resolve id and slug, copying every collection so later mutation of the
/// input cannot leak into the registry.
///
/// Id resolution order: explicit id, non-empty slug, token, `bot-<index>`.
///
/// # Errors
///
/// Returns [`RegistryError::BotIdUnresolved`] when every source is empty.
pub fn normalize_bot_options(
    options: BotOptions,
    index: Option<usize>,
) -> Result<NormalizedBotOptions, RegistryError> {
    let slug = options
        .slug
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SLUG)
        .to_string();

    let id = options
        .id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| {
            options
                .slug
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .or_else(|| {
            let token = options.token.trim();
            (!token.is_empty()).then(|| token.to_string())
        })
        .or_else(|| index.map(|i| format!("bot-{}", i)))
        .ok_or(RegistryError::BotIdUnresolved)?;

    Ok(NormalizedBotOptions {
        id,
        token: options.token,
        slug,
        initial_page_id: options.initial_page_id,
        pages: options.pages,
        handlers: options.handlers,
        middlewares: options.middlewares,
        keyboards: options.keyboards,
        page_middlewares: options.page_middlewares,
        services: options.services,
        session_storage: options.session_storage,
        database: options.database,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;

    #[test]
    fn test_id_resolution_prefers_explicit_id() {
        let options = BotOptions::new("TOKEN").with_id("my-bot").with_slug("shop");
        let normalized = normalize_bot_options(options, None).expect("normalize failed");
        assert_eq!(normalized.id, "my-bot");
        assert_eq!(normalized.slug, "shop");
    }

    #[test]
    fn test_id_falls_back_to_slug_then_token() {
        let from_slug = normalize_bot_options(BotOptions::new("TOKEN").with_slug("shop"), None)
            .expect("normalize failed");
        assert_eq!(from_slug.id, "shop");

        let from_token =
            normalize_bot_options(BotOptions::new("TOKEN"), None).expect("normalize failed");
        assert_eq!(from_token.id, "TOKEN");
    }

    #[test]
    fn test_id_falls_back_to_index() {
        let normalized =
            normalize_bot_options(BotOptions::new(""), Some(3)).expect("normalize failed");
        assert_eq!(normalized.id, "bot-3");
    }

    #[test]
    fn test_id_unresolvable_errors() {
        let result = normalize_bot_options(BotOptions::new(""), None);
        assert!(matches!(result, Err(RegistryError::BotIdUnresolved)));
    }

    #[test]
    fn test_blank_strings_do_not_resolve_ids() {
        let options = BotOptions::new("TOKEN").with_id("   ").with_slug("  ");
        let normalized = normalize_bot_options(options, None).expect("normalize failed");
        assert_eq!(normalized.id, "TOKEN");
        assert_eq!(normalized.slug, DEFAULT_SLUG);
    }

    #[test]
    fn test_slug_defaults() {
        let normalized =
            normalize_bot_options(BotOptions::new("TOKEN"), None).expect("normalize failed");
        assert_eq!(normalized.slug, DEFAULT_SLUG);
    }

    #[test]
    fn test_collections_are_copied() {
        let mut options = BotOptions::new("TOKEN").with_page(Page::new("a"));
        let normalized =
            normalize_bot_options(options.clone(), None).expect("normalize failed");

        // Mutating the original afterwards must not affect the snapshot.
        options.pages.push(Page::new("b"));
        assert_eq!(normalized.pages.len(), 1);
        assert_eq!(normalized.pages[0].id, "a");
    }
}
