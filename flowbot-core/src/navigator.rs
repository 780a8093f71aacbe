//! Page navigator.
//!
//! Owns the page registry, keyboard registry, and per-page middleware
//! resolution cache. Validates input, resolves successors, and renders
//! pages (including middleware guards and redirects).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;

use crate::context::Context;
use crate::message::IncomingMessage;
use crate::messages::MessageTable;
use crate::page::{Guard, Keyboard, Page, PageMiddlewareConfig, PageMiddlewareRef, Validation};
use crate::transport::{ReplyMarkup, SendOptions, TransportError};

/// Errors surfaced while rendering a page.
#[derive(Debug, Error)]
pub enum NavigatorError {
    /// Sending through the transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A dynamic content factory failed.
    #[error("content for page '{page_id}' failed: {reason}")]
    Content {
        /// Page whose factory failed.
        page_id: String,
        /// The factory's error description.
        reason: String,
    },
}

struct NavigatorInner {
    pages: HashMap<String, Arc<Page>>,
    /// Registration order, for sequential fallback.
    order: Vec<String>,
    /// The configured initial page id, which may be dangling.
    explicit_initial: Option<String>,
    keyboards: Vec<Keyboard>,
    named_middlewares: HashMap<String, PageMiddlewareConfig>,
    /// Per-page resolved middleware lists, sorted by descending priority.
    middleware_cache: HashMap<String, Vec<PageMiddlewareConfig>>,
}

/// Registry and renderer for a bot's page graph.
pub struct PageNavigator {
    messages: Arc<MessageTable>,
    inner: Mutex<NavigatorInner>,
}

impl PageNavigator {
    /// Create an empty navigator with an optional configured initial page.
    pub fn new(messages: Arc<MessageTable>, initial_page_id: Option<String>) -> Self {
        Self {
            messages,
            inner: Mutex::new(NavigatorInner {
                pages: HashMap::new(),
                order: Vec::new(),
                explicit_initial: initial_page_id.filter(|id| !id.trim().is_empty()),
                keyboards: Vec::new(),
                named_middlewares: HashMap::new(),
                middleware_cache: HashMap::new(),
            }),
        }
    }

    /// Register named page middlewares. Entries without a name cannot be
    /// referenced and are dropped with a warning.
    pub fn register_page_middlewares(&self, configs: Vec<PageMiddlewareConfig>) {
        let mut inner = self.inner.lock().expect("navigator lock poisoned");
        for config in configs {
            match config.name.clone() {
                Some(name) => {
                    if inner.named_middlewares.insert(name.clone(), config).is_some() {
                        tracing::warn!("Replacing page middleware registered as '{}'", name);
                    }
                }
                None => {
                    tracing::warn!("Ignoring unnamed page middleware; pages reference by name");
                }
            }
        }
    }

    /// Register keyboards. A second non-persistent keyboard with the same id
    /// replaces the first with a warning.
    pub fn register_keyboards(&self, keyboards: Vec<Keyboard>) {
        let mut inner = self.inner.lock().expect("navigator lock poisoned");
        for keyboard in keyboards {
            if !keyboard.persistent
                && let Some(pos) = inner
                    .keyboards
                    .iter()
                    .position(|k| !k.persistent && k.id == keyboard.id)
            {
                tracing::warn!("Replacing non-persistent keyboard '{}'", keyboard.id);
                inner.keyboards[pos] = keyboard;
                continue;
            }
            inner.keyboards.push(keyboard);
        }
    }

    /// Upsert pages by id. Pages with empty ids are skipped with a warning.
    /// Each registration recomputes that page's sorted middleware list.
    pub fn register_pages(&self, pages: Vec<Page>) {
        let mut inner = self.inner.lock().expect("navigator lock poisoned");
        for page in pages {
            if page.id.trim().is_empty() {
                tracing::warn!("{}", self.messages.page_without_id);
                continue;
            }

            let id = page.id.clone();
            let resolved = Self::resolve_middlewares(&inner.named_middlewares, &page);
            inner.middleware_cache.insert(id.clone(), resolved);

            if inner.pages.insert(id.clone(), Arc::new(page)).is_none() {
                inner.order.push(id);
            }
        }

        if let Some(explicit) = inner.explicit_initial.clone()
            && !inner.pages.contains_key(&explicit)
            && !inner.order.is_empty()
        {
            tracing::warn!("{}", self.messages.dangling_initial_page(&explicit));
        }
    }

    fn resolve_middlewares(
        named: &HashMap<String, PageMiddlewareConfig>,
        page: &Page,
    ) -> Vec<PageMiddlewareConfig> {
        let mut configs: Vec<PageMiddlewareConfig> = Vec::new();
        for reference in &page.middlewares {
            match reference {
                PageMiddlewareRef::Named(name) => match named.get(name) {
                    Some(config) => configs.push(config.clone()),
                    None => {
                        tracing::warn!(
                            "Page '{}' references unknown middleware '{}'",
                            page.id,
                            name
                        );
                    }
                },
                PageMiddlewareRef::Inline(config) => configs.push(config.clone()),
            }
        }
        // Stable sort keeps declaration order within equal priorities.
        configs.sort_by(|a, b| b.priority.cmp(&a.priority));
        configs
    }

    /// Look up a page by id.
    pub fn resolve_page(&self, id: &str) -> Option<Arc<Page>> {
        self.inner
            .lock()
            .expect("navigator lock poisoned")
            .pages
            .get(id)
            .cloned()
    }

    /// The page a fresh chat starts on: the configured initial page when it
    /// resolves, otherwise the first registered page.
    pub fn resolve_initial_page(&self) -> Option<Arc<Page>> {
        let inner = self.inner.lock().expect("navigator lock poisoned");
        inner
            .explicit_initial
            .as_ref()
            .and_then(|id| inner.pages.get(id).cloned())
            .or_else(|| {
                inner
                    .order
                    .first()
                    .and_then(|id| inner.pages.get(id).cloned())
            })
    }

    /// The page registered immediately after `id`, if any.
    pub fn page_after(&self, id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("navigator lock poisoned");
        let position = inner.order.iter().position(|p| p == id)?;
        inner.order.get(position + 1).cloned()
    }

    /// The resolved middleware chain for a page.
    fn middlewares_for(&self, page_id: &str) -> Vec<PageMiddlewareConfig> {
        self.inner
            .lock()
            .expect("navigator lock poisoned")
            .middleware_cache
            .get(page_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Pull the submitted value out of a message: text, caption, contact,
    /// location, photo, then document; the whole message as a last resort.
    pub fn extract_message_value(&self, message: &IncomingMessage) -> Value {
        if let Some(text) = &message.text {
            return Value::String(text.clone());
        }
        if let Some(caption) = &message.caption {
            return Value::String(caption.clone());
        }
        if let Some(contact) = &message.contact {
            return serde_json::to_value(contact).unwrap_or(Value::Null);
        }
        if let Some(location) = &message.location {
            return serde_json::to_value(location).unwrap_or(Value::Null);
        }
        if let Some(photo) = &message.photo {
            return serde_json::to_value(photo).unwrap_or(Value::Null);
        }
        if let Some(document) = &message.document {
            return serde_json::to_value(document).unwrap_or(Value::Null);
        }
        message.to_value()
    }

    /// Validate a submitted value against the page's schema and custom
    /// validator. Validator failures never escape; they become invalid
    /// results carrying the error text.
    pub async fn validate_page_value(
        &self,
        page: &Page,
        value: &Value,
        ctx: Context,
    ) -> Validation {
        if let Some(schema) = &page.schema
            && let Err(errors) = schema.validate(value)
        {
            return Validation {
                valid: false,
                message: Some(errors.join("\n")),
                ..Validation::default()
            };
        }

        if let Some(validator) = &page.validator {
            return match validator(ctx, value.clone()).await {
                Ok(mut validation) => {
                    validation.message = validation
                        .message
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty());
                    validation.redirect_to = validation
                        .redirect_to
                        .map(|r| r.trim().to_string())
                        .filter(|r| !r.is_empty());
                    validation
                }
                Err(error) => {
                    let text = error.to_string();
                    Validation {
                        valid: false,
                        message: if text.is_empty() {
                            Some(self.messages.validation_failed.clone())
                        } else {
                            Some(text)
                        },
                        ..Validation::default()
                    }
                }
            };
        }

        Validation::ok()
    }

    /// The id of the page to advance to: the page's own resolver when it
    /// yields a non-empty id, the registration-order successor otherwise.
    pub async fn resolve_next_page_id(&self, page: &Page, ctx: Context) -> Option<String> {
        if let Some(next) = &page.next {
            match next(ctx).await {
                Ok(Some(id)) if !id.trim().is_empty() => return Some(id.trim().to_string()),
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        "Next resolver for page '{}' failed: {}; using registration order",
                        page.id,
                        error
                    );
                }
            }
        }
        self.page_after(&page.id)
    }

    /// Run the page's middleware chain and, when allowed, send its content.
    ///
    /// The first non-allow guard controls the outcome: a redirect to a
    /// different registered page renders that page instead (self-redirects
    /// and revisits are logged and fall through to rejection); otherwise the
    /// guard's message — or the default rejection text — is sent. Returns
    /// the id actually rendered so callers can persist the final position.
    ///
    /// # Errors
    ///
    /// Returns [`NavigatorError`] when a content factory or the transport
    /// fails.
    pub async fn render_page(
        &self,
        page: &Arc<Page>,
        ctx: Context,
    ) -> Result<String, NavigatorError> {
        let mut current = Arc::clone(page);
        let mut visited: Vec<String> = Vec::new();

        loop {
            visited.push(current.id.clone());

            let mut verdict = Guard::allow();
            for config in self.middlewares_for(&current.id) {
                let guard = match (config.handler)(ctx.clone(), Arc::clone(&current)).await {
                    Ok(guard) => guard.normalized(),
                    Err(error) => Guard {
                        allow: false,
                        message: Some(error.to_string()),
                        redirect_to: None,
                    },
                };
                if !guard.allow {
                    verdict = guard;
                    break;
                }
            }

            if verdict.allow {
                if let Some(content) = &current.content {
                    let payload =
                        content
                            .resolve(&ctx)
                            .await
                            .map_err(|e| NavigatorError::Content {
                                page_id: current.id.clone(),
                                reason: e.to_string(),
                            })?;

                    let mut options = payload.options;
                    // A markup set by the payload wins; the keyboard is
                    // injected only when the payload left it unset.
                    if options.reply_markup.is_none() {
                        options.reply_markup = self.resolve_keyboard(&current.id, &ctx).await;
                    }

                    ctx.transport
                        .send_message(&ctx.chat_id, &payload.text, options)
                        .await?;
                }
                return Ok(current.id.clone());
            }

            if let Some(target_id) = &verdict.redirect_to {
                if visited.contains(target_id) {
                    tracing::warn!(
                        "Ignoring circular page middleware redirect from '{}' to '{}'",
                        current.id,
                        target_id
                    );
                } else if let Some(target) = self.resolve_page(target_id) {
                    current = target;
                    continue;
                } else {
                    tracing::warn!(
                        "Page middleware redirect target '{}' not registered",
                        target_id
                    );
                }
            }

            let text = verdict
                .message
                .unwrap_or_else(|| self.messages.page_rejected.clone());
            ctx.transport
                .send_message(&ctx.chat_id, &text, SendOptions::default())
                .await?;
            return Ok(current.id.clone());
        }
    }

    /// Resolve a keyboard for a page: the page's own non-persistent keyboard
    /// first, then the first persistent keyboard yielding markup.
    async fn resolve_keyboard(&self, page_id: &str, ctx: &Context) -> Option<ReplyMarkup> {
        let keyboards: Vec<Keyboard> = self
            .inner
            .lock()
            .expect("navigator lock poisoned")
            .keyboards
            .clone();

        if let Some(keyboard) = keyboards
            .iter()
            .find(|k| !k.persistent && k.id == page_id)
        {
            match (keyboard.resolver)(ctx.clone()).await {
                Ok(Some(markup)) => return Some(markup),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!("Keyboard '{}' resolver failed: {}", keyboard.id, error);
                }
            }
        }

        for keyboard in keyboards.iter().filter(|k| k.persistent) {
            match (keyboard.resolver)(ctx.clone()).await {
                Ok(Some(markup)) => return Some(markup),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!("Keyboard '{}' resolver failed: {}", keyboard.id, error);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::context::SessionData;
    use crate::gateway::NoopGateway;
    use crate::message::{Contact, IncomingChat, TelegramUser};
    use crate::page::{PageSchema, guard_fn, keyboard_fn, next_fn, validator_fn};
    use crate::transport::mock::MockTransport;
    use crate::transport::{InlineButton, Transport};

    /// Schema double that always reports two violations.
    struct AlwaysInvalidSchema;

    impl PageSchema for AlwaysInvalidSchema {
        fn validate(&self, _value: &Value) -> Result<(), Vec<String>> {
            Err(vec!["too short".to_string(), "not a number".to_string()])
        }
    }

    fn navigator(initial: Option<&str>) -> PageNavigator {
        PageNavigator::new(
            Arc::new(MessageTable::default()),
            initial.map(str::to_string),
        )
    }

    fn context(transport: &Arc<MockTransport>) -> Context {
        Context {
            bot_id: "bot".to_string(),
            chat_id: "1".to_string(),
            transport: Arc::clone(transport) as Arc<dyn Transport>,
            message: None,
            metadata: None,
            state: SessionData::default(),
            user: None,
            persistence: Arc::new(NoopGateway),
            services: Arc::new(HashMap::new()),
        }
    }

    // --- registration and lookup ---

    #[test]
    fn test_register_skips_empty_ids() {
        let nav = navigator(None);
        nav.register_pages(vec![Page::new(""), Page::new("  "), Page::new("a")]);
        assert!(nav.resolve_page("a").is_some());
        assert!(nav.resolve_page("").is_none());
        assert_eq!(nav.resolve_initial_page().expect("initial").id, "a");
    }

    #[test]
    fn test_register_upserts_by_id_keeping_order() {
        let nav = navigator(None);
        nav.register_pages(vec![
            Page::new("a").with_text("first"),
            Page::new("b").with_text("second"),
        ]);
        nav.register_pages(vec![Page::new("a").with_text("replaced")]);

        // Order is unchanged: `a` still precedes `b`.
        assert_eq!(nav.page_after("a").as_deref(), Some("b"));
        let page = nav.resolve_page("a").expect("page");
        match &page.content {
            Some(crate::page::PageContent::Static(payload)) => {
                assert_eq!(payload.text, "replaced");
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_initial_page_explicit_and_fallback() {
        let nav = navigator(Some("b"));
        nav.register_pages(vec![Page::new("a"), Page::new("b")]);
        assert_eq!(nav.resolve_initial_page().expect("initial").id, "b");

        // Dangling explicit id falls back to the first registered page.
        let nav = navigator(Some("missing"));
        nav.register_pages(vec![Page::new("a"), Page::new("b")]);
        assert_eq!(nav.resolve_initial_page().expect("initial").id, "a");
    }

    #[test]
    fn test_page_after_walks_registration_order() {
        let nav = navigator(None);
        nav.register_pages(vec![Page::new("a"), Page::new("b"), Page::new("c")]);
        assert_eq!(nav.page_after("a").as_deref(), Some("b"));
        assert_eq!(nav.page_after("b").as_deref(), Some("c"));
        assert!(nav.page_after("c").is_none());
        assert!(nav.page_after("unknown").is_none());
    }

    // --- extraction ---

    #[test]
    fn test_extract_prefers_text() {
        let nav = navigator(None);
        let mut msg = IncomingMessage::text(1, "hello");
        msg.caption = Some("cap".to_string());
        assert_eq!(nav.extract_message_value(&msg), json!("hello"));
    }

    #[test]
    fn test_extract_caption_then_contact() {
        let nav = navigator(None);
        let mut msg = IncomingMessage {
            message_id: 1,
            chat: IncomingChat { id: 1 },
            from: None,
            text: None,
            caption: Some("cap".to_string()),
            contact: Some(Contact {
                phone_number: "+1".to_string(),
                first_name: "A".to_string(),
                last_name: None,
                user_id: None,
            }),
            location: None,
            photo: None,
            document: None,
        };
        assert_eq!(nav.extract_message_value(&msg), json!("cap"));

        msg.caption = None;
        let value = nav.extract_message_value(&msg);
        assert_eq!(value["phoneNumber"], "+1");
    }

    #[test]
    fn test_extract_falls_back_to_whole_message() {
        let nav = navigator(None);
        let msg = IncomingMessage {
            message_id: 9,
            chat: IncomingChat { id: 5 },
            from: Some(TelegramUser::new(2)),
            text: None,
            caption: None,
            contact: None,
            location: None,
            photo: None,
            document: None,
        };
        let value = nav.extract_message_value(&msg);
        assert_eq!(value["messageId"], 9);
        assert_eq!(value["chat"]["id"], 5);
    }

    // --- validation ---

    #[tokio::test]
    async fn test_validate_without_checks_passes() {
        let nav = navigator(None);
        let transport = MockTransport::new();
        let page = Page::new("a");
        let result = nav
            .validate_page_value(&page, &json!("x"), context(&transport))
            .await;
        assert!(result.valid);
    }

    #[tokio::test]
    async fn test_validate_schema_failure_joins_messages() {
        let nav = navigator(None);
        let transport = MockTransport::new();
        let page = Page::new("a").with_schema(Arc::new(AlwaysInvalidSchema));
        let result = nav
            .validate_page_value(&page, &json!("x"), context(&transport))
            .await;
        assert!(!result.valid);
        let message = result.message.expect("message");
        assert!(message.contains("too short"));
        assert!(message.contains("not a number"));
    }

    #[tokio::test]
    async fn test_validate_custom_validator_runs_after_schema() {
        let nav = navigator(None);
        let transport = MockTransport::new();
        let page = Page::new("a").with_validator(validator_fn(|_ctx, value| async move {
            Ok(if value == json!("yes") {
                Validation::ok()
            } else {
                Validation::fail("  say yes  ")
            })
        }));

        let ok = nav
            .validate_page_value(&page, &json!("yes"), context(&transport))
            .await;
        assert!(ok.valid);

        let rejected = nav
            .validate_page_value(&page, &json!("no"), context(&transport))
            .await;
        assert!(!rejected.valid);
        // Message is trimmed by normalization.
        assert_eq!(rejected.message.as_deref(), Some("say yes"));
    }

    #[tokio::test]
    async fn test_validate_validator_error_becomes_invalid() {
        let nav = navigator(None);
        let transport = MockTransport::new();
        let page = Page::new("a").with_validator(validator_fn(|_ctx, _value| async move {
            Err::<Validation, crate::BoxError>("lookup exploded".into())
        }));
        let result = nav
            .validate_page_value(&page, &json!("x"), context(&transport))
            .await;
        assert!(!result.valid);
        assert_eq!(result.message.as_deref(), Some("lookup exploded"));
    }

    // --- next resolution ---

    #[tokio::test]
    async fn test_next_resolver_wins_over_order() {
        let nav = navigator(None);
        nav.register_pages(vec![
            Page::new("a").with_next(next_fn(|_ctx| async { Ok(Some("c".to_string())) })),
            Page::new("b"),
            Page::new("c"),
        ]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("a").expect("page");
        let next = nav.resolve_next_page_id(&page, context(&transport)).await;
        assert_eq!(next.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_next_empty_result_falls_back_to_order() {
        let nav = navigator(None);
        nav.register_pages(vec![
            Page::new("a").with_next(next_fn(|_ctx| async { Ok(Some("   ".to_string())) })),
            Page::new("b"),
        ]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("a").expect("page");
        let next = nav.resolve_next_page_id(&page, context(&transport)).await;
        assert_eq!(next.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_next_none_on_last_page() {
        let nav = navigator(None);
        nav.register_pages(vec![Page::new("a"), Page::new("b")]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("b").expect("page");
        assert!(
            nav.resolve_next_page_id(&page, context(&transport))
                .await
                .is_none()
        );
    }

    // --- rendering ---

    #[tokio::test]
    async fn test_render_sends_content() {
        let nav = navigator(None);
        nav.register_pages(vec![Page::new("a").with_text("Welcome!")]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("a").expect("page");

        let rendered = nav
            .render_page(&page, context(&transport))
            .await
            .expect("render failed");

        assert_eq!(rendered, "a");
        assert_eq!(transport.sent_texts(), vec!["Welcome!"]);
    }

    #[tokio::test]
    async fn test_render_page_without_content_is_silent() {
        let nav = navigator(None);
        nav.register_pages(vec![Page::new("quiet")]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("quiet").expect("page");

        let rendered = nav
            .render_page(&page, context(&transport))
            .await
            .expect("render failed");
        assert_eq!(rendered, "quiet");
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_render_injects_page_keyboard() {
        let nav = navigator(None);
        nav.register_keyboards(vec![Keyboard::new(
            "a",
            keyboard_fn(|_ctx| async {
                Ok(Some(ReplyMarkup::Inline(vec![vec![InlineButton::callback(
                    "Go", "go",
                )]])))
            }),
        )]);
        nav.register_pages(vec![Page::new("a").with_text("pick")]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("a").expect("page");

        nav.render_page(&page, context(&transport))
            .await
            .expect("render failed");

        let sent = transport.sent();
        assert!(matches!(
            sent[0].options.reply_markup,
            Some(ReplyMarkup::Inline(_))
        ));
    }

    #[tokio::test]
    async fn test_render_payload_markup_wins_over_keyboard() {
        let nav = navigator(None);
        nav.register_keyboards(vec![Keyboard::new(
            "a",
            keyboard_fn(|_ctx| async {
                Ok(Some(ReplyMarkup::Inline(vec![vec![InlineButton::callback(
                    "keyboard", "kb",
                )]])))
            }),
        )]);
        let payload = crate::page::PagePayload::new("pick").with_options(SendOptions {
            reply_markup: Some(ReplyMarkup::Remove),
            ..SendOptions::default()
        });
        nav.register_pages(vec![
            Page::new("a").with_content(crate::page::PageContent::Static(payload)),
        ]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("a").expect("page");

        nav.render_page(&page, context(&transport))
            .await
            .expect("render failed");

        let sent = transport.sent();
        assert_eq!(sent[0].options.reply_markup, Some(ReplyMarkup::Remove));
    }

    #[tokio::test]
    async fn test_render_persistent_keyboard_fallback() {
        let nav = navigator(None);
        nav.register_keyboards(vec![
            // Page keyboard yields nothing, persistent one provides markup.
            Keyboard::new("a", keyboard_fn(|_ctx| async { Ok(None) })),
            Keyboard::persistent(
                "global",
                keyboard_fn(|_ctx| async {
                    Ok(Some(ReplyMarkup::Keyboard(crate::transport::ReplyKeyboard {
                        rows: vec![vec!["Menu".to_string()]],
                        resize: true,
                        one_time: false,
                    })))
                }),
            ),
        ]);
        nav.register_pages(vec![Page::new("a").with_text("pick")]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("a").expect("page");

        nav.render_page(&page, context(&transport))
            .await
            .expect("render failed");

        let sent = transport.sent();
        assert!(matches!(
            sent[0].options.reply_markup,
            Some(ReplyMarkup::Keyboard(_))
        ));
    }

    #[tokio::test]
    async fn test_render_denied_sends_default_rejection() {
        let nav = navigator(None);
        nav.register_pages(vec![Page::new("a").with_text("secret").with_middleware(
            PageMiddlewareRef::Inline(PageMiddlewareConfig::new(guard_fn(|_ctx, _page| async {
                Ok(Guard::deny())
            }))),
        )]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("a").expect("page");

        let rendered = nav
            .render_page(&page, context(&transport))
            .await
            .expect("render failed");

        assert_eq!(rendered, "a");
        assert_eq!(
            transport.sent_texts(),
            vec![MessageTable::default().page_rejected]
        );
    }

    #[tokio::test]
    async fn test_render_denied_custom_message_and_priority() {
        let nav = navigator(None);
        // The higher-priority middleware denies first.
        nav.register_pages(vec![
            Page::new("a")
                .with_text("secret")
                .with_middleware(PageMiddlewareRef::Inline(
                    PageMiddlewareConfig::new(guard_fn(|_ctx, _page| async {
                        Ok(Guard::deny_with_message("low priority deny"))
                    }))
                    .with_priority(0),
                ))
                .with_middleware(PageMiddlewareRef::Inline(
                    PageMiddlewareConfig::new(guard_fn(|_ctx, _page| async {
                        Ok(Guard::deny_with_message("high priority deny"))
                    }))
                    .with_priority(10),
                )),
        ]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("a").expect("page");

        nav.render_page(&page, context(&transport))
            .await
            .expect("render failed");
        assert_eq!(transport.sent_texts(), vec!["high priority deny"]);
    }

    #[tokio::test]
    async fn test_render_redirect_renders_target() {
        let nav = navigator(None);
        nav.register_pages(vec![
            Page::new("login").with_text("Please log in"),
            Page::new("account").with_text("Your account").with_middleware(
                PageMiddlewareRef::Inline(PageMiddlewareConfig::new(guard_fn(
                    |_ctx, _page| async { Ok(Guard::redirect("login")) },
                ))),
            ),
        ]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("account").expect("page");

        let rendered = nav
            .render_page(&page, context(&transport))
            .await
            .expect("render failed");

        assert_eq!(rendered, "login");
        assert_eq!(transport.sent_texts(), vec!["Please log in"]);
    }

    #[tokio::test]
    async fn test_render_self_redirect_falls_through_to_rejection() {
        let nav = navigator(None);
        nav.register_pages(vec![Page::new("a").with_text("content").with_middleware(
            PageMiddlewareRef::Inline(PageMiddlewareConfig::new(guard_fn(|_ctx, _page| async {
                Ok(Guard::redirect("a"))
            }))),
        )]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("a").expect("page");

        let rendered = nav
            .render_page(&page, context(&transport))
            .await
            .expect("render failed");

        assert_eq!(rendered, "a");
        assert_eq!(
            transport.sent_texts(),
            vec![MessageTable::default().page_rejected]
        );
    }

    #[tokio::test]
    async fn test_render_named_middleware_resolved_from_registry() {
        let nav = navigator(None);
        nav.register_page_middlewares(vec![
            PageMiddlewareConfig::new(guard_fn(|ctx, _page| async move {
                Ok(if ctx.state.get("authed").is_some() {
                    Guard::allow()
                } else {
                    Guard::deny_with_message("log in first")
                })
            }))
            .with_name("auth"),
        ]);
        nav.register_pages(vec![
            Page::new("private")
                .with_text("hidden")
                .with_middleware(PageMiddlewareRef::Named("auth".to_string())),
        ]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("private").expect("page");

        // Denied without the flag.
        nav.render_page(&page, context(&transport))
            .await
            .expect("render failed");
        assert_eq!(transport.sent_texts(), vec!["log in first"]);

        // Allowed with it.
        let ctx = context(&transport);
        ctx.state.set("authed", json!(true));
        let rendered = nav.render_page(&page, ctx).await.expect("render failed");
        assert_eq!(rendered, "private");
        assert_eq!(transport.sent_texts().last().map(String::as_str), Some("hidden"));
    }

    #[tokio::test]
    async fn test_render_middleware_error_becomes_rejection_text() {
        let nav = navigator(None);
        nav.register_pages(vec![Page::new("a").with_text("content").with_middleware(
            PageMiddlewareRef::Inline(PageMiddlewareConfig::new(guard_fn(|_ctx, _page| async {
                Err::<Guard, crate::BoxError>("guard crashed".into())
            }))),
        )]);
        let transport = MockTransport::new();
        let page = nav.resolve_page("a").expect("page");

        nav.render_page(&page, context(&transport))
            .await
            .expect("render failed");
        assert_eq!(transport.sent_texts(), vec!["guard crashed"]);
    }
}
