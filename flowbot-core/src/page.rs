//! Page model: dialog step definitions.
//!
//! A [`Page`] bundles what one step of a conversation needs — prompt
//! content, input validation, a side effect, and a successor resolver —
//! behind plain async capabilities resolved against a [`Context`].

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::BoxError;
use crate::context::Context;
use crate::transport::{ReplyMarkup, SendOptions};

/// Resolved content for one render: the prompt text plus send options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PagePayload {
    pub text: String,
    pub options: SendOptions,
}

impl PagePayload {
    /// Payload with default send options.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: SendOptions::default(),
        }
    }

    /// Override the send options.
    pub fn with_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }
}

/// Async factory producing a page's content from the render context.
pub type ContentFn =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<PagePayload, BoxError>> + Send + Sync>;

/// Page content: fixed at registration, or produced per render.
#[derive(Clone)]
pub enum PageContent {
    Static(PagePayload),
    Dynamic(ContentFn),
}

impl PageContent {
    /// Resolve the payload for this render.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error for dynamic content.
    pub async fn resolve(&self, ctx: &Context) -> Result<PagePayload, BoxError> {
        match self {
            Self::Static(payload) => Ok(payload.clone()),
            Self::Dynamic(factory) => factory(ctx.clone()).await,
        }
    }
}

impl fmt::Debug for PageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(payload) => f.debug_tuple("Static").field(payload).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Declarative validation port.
///
/// Schema libraries are plugged in behind this trait; the framework only
/// needs pass/fail plus human-readable error messages.
pub trait PageSchema: Send + Sync {
    /// Validate a submitted value.
    ///
    /// # Errors
    ///
    /// Returns the list of violation messages shown to the user.
    fn validate(&self, value: &Value) -> Result<(), Vec<String>>;
}

/// Outcome of validating a submitted value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    pub valid: bool,
    /// Error text shown to the user when invalid.
    pub message: Option<String>,
    /// Page to render instead of re-rendering the current one when invalid.
    pub redirect_to: Option<String>,
    /// Replacement value stored instead of the raw submission when valid.
    pub save_value: Option<Value>,
}

impl Validation {
    /// Accept the submission as-is.
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    /// Accept the submission but store `value` instead.
    pub fn ok_with_value(value: Value) -> Self {
        Self {
            valid: true,
            save_value: Some(value),
            ..Self::default()
        }
    }

    /// Reject with an error message.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Reject and redirect the chat to another page.
    pub fn fail_redirect(page_id: impl Into<String>) -> Self {
        Self {
            valid: false,
            redirect_to: Some(page_id.into()),
            ..Self::default()
        }
    }
}

impl From<bool> for Validation {
    fn from(valid: bool) -> Self {
        Self {
            valid,
            ..Self::default()
        }
    }
}

/// Decision of a page middleware consulted before rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Guard {
    pub allow: bool,
    /// Rejection text sent when denied without redirect.
    pub message: Option<String>,
    /// Page rendered instead when denied.
    pub redirect_to: Option<String>,
}

impl Guard {
    pub fn allow() -> Self {
        Self {
            allow: true,
            ..Self::default()
        }
    }

    pub fn deny() -> Self {
        Self::default()
    }

    pub fn deny_with_message(message: impl Into<String>) -> Self {
        Self {
            allow: false,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn redirect(page_id: impl Into<String>) -> Self {
        Self {
            allow: false,
            redirect_to: Some(page_id.into()),
            ..Self::default()
        }
    }

    /// Trim message and redirect target; empty strings become absent.
    pub fn normalized(mut self) -> Self {
        self.message = self
            .message
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        self.redirect_to = self
            .redirect_to
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        self
    }
}

impl From<bool> for Guard {
    fn from(allow: bool) -> Self {
        Self {
            allow,
            ..Self::default()
        }
    }
}

/// Async custom validator.
pub type ValidatorFn = Arc<
    dyn Fn(Context, Value) -> BoxFuture<'static, Result<Validation, BoxError>> + Send + Sync,
>;

/// Side effect run after a submission is accepted and persisted.
pub type SideEffectFn =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Successor resolver; `None`/empty falls back to registration order.
pub type NextFn =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Option<String>, BoxError>> + Send + Sync>;

/// Keyboard resolver returning markup or nothing.
pub type KeyboardFn = Arc<
    dyn Fn(Context) -> BoxFuture<'static, Result<Option<ReplyMarkup>, BoxError>> + Send + Sync,
>;

/// Page middleware handler: receives the context and the page about to be
/// rendered, decides whether rendering may proceed.
pub type PageGuardFn = Arc<
    dyn Fn(Context, Arc<Page>) -> BoxFuture<'static, Result<Guard, BoxError>> + Send + Sync,
>;

/// Wrap a plain async closure into a [`ContentFn`].
pub fn content_fn<F, Fut>(f: F) -> ContentFn
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PagePayload, BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Wrap a plain async closure into a [`ValidatorFn`].
pub fn validator_fn<F, Fut>(f: F) -> ValidatorFn
where
    F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Validation, BoxError>> + Send + 'static,
{
    Arc::new(move |ctx, value| Box::pin(f(ctx, value)))
}

/// Wrap a plain async closure into a [`SideEffectFn`].
pub fn side_effect_fn<F, Fut>(f: F) -> SideEffectFn
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Wrap a plain async closure into a [`NextFn`].
pub fn next_fn<F, Fut>(f: F) -> NextFn
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Wrap a plain async closure into a [`KeyboardFn`].
pub fn keyboard_fn<F, Fut>(f: F) -> KeyboardFn
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<ReplyMarkup>, BoxError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Wrap a plain async closure into a [`PageGuardFn`].
pub fn guard_fn<F, Fut>(f: F) -> PageGuardFn
where
    F: Fn(Context, Arc<Page>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Guard, BoxError>> + Send + 'static,
{
    Arc::new(move |ctx, page| Box::pin(f(ctx, page)))
}

/// A page middleware declaration, optionally named for reuse.
#[derive(Clone)]
pub struct PageMiddlewareConfig {
    /// Name under which pages can reference this middleware.
    pub name: Option<String>,
    /// Evaluation priority; higher runs earlier. Defaults to 0.
    pub priority: i32,
    pub handler: PageGuardFn,
}

impl PageMiddlewareConfig {
    pub fn new(handler: PageGuardFn) -> Self {
        Self {
            name: None,
            priority: 0,
            handler,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for PageMiddlewareConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMiddlewareConfig")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Reference from a page to a middleware: registered by name, or inline.
#[derive(Clone)]
pub enum PageMiddlewareRef {
    Named(String),
    Inline(PageMiddlewareConfig),
}

impl fmt::Debug for PageMiddlewareRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Inline(cfg) => f.debug_tuple("Inline").field(cfg).finish(),
        }
    }
}

/// A keyboard declaration. A keyboard whose id matches a page id is that
/// page's own; persistent keyboards apply to every page as a fallback.
#[derive(Clone)]
pub struct Keyboard {
    pub id: String,
    pub persistent: bool,
    pub resolver: KeyboardFn,
}

impl Keyboard {
    /// A page-scoped keyboard (id should match the page id).
    pub fn new(id: impl Into<String>, resolver: KeyboardFn) -> Self {
        Self {
            id: id.into(),
            persistent: false,
            resolver,
        }
    }

    /// A persistent fallback keyboard.
    pub fn persistent(id: impl Into<String>, resolver: KeyboardFn) -> Self {
        Self {
            id: id.into(),
            persistent: true,
            resolver,
        }
    }
}

impl fmt::Debug for Keyboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyboard")
            .field("id", &self.id)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

/// One dialog step.
#[derive(Clone)]
pub struct Page {
    /// Unique within a bot; empty ids are rejected at registration.
    pub id: String,
    /// Prompt content; a page without content renders silently.
    pub content: Option<PageContent>,
    /// Declarative validator, checked before the custom one.
    pub schema: Option<Arc<dyn PageSchema>>,
    /// Custom async validator.
    pub validator: Option<ValidatorFn>,
    /// Side effect run after a submission is accepted.
    pub on_valid: Option<SideEffectFn>,
    /// Successor resolver.
    pub next: Option<NextFn>,
    /// Middlewares consulted before rendering, in declaration order.
    pub middlewares: Vec<PageMiddlewareRef>,
}

impl Page {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: None,
            schema: None,
            validator: None,
            on_valid: None,
            next: None,
            middlewares: Vec::new(),
        }
    }

    /// Static text content with default send options.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content = Some(PageContent::Static(PagePayload::new(text)));
        self
    }

    pub fn with_content(mut self, content: PageContent) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_schema(mut self, schema: Arc<dyn PageSchema>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_validator(mut self, validator: ValidatorFn) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_on_valid(mut self, on_valid: SideEffectFn) -> Self {
        self.on_valid = Some(on_valid);
        self
    }

    pub fn with_next(mut self, next: NextFn) -> Self {
        self.next = Some(next);
        self
    }

    pub fn with_middleware(mut self, reference: PageMiddlewareRef) -> Self {
        self.middlewares.push(reference);
        self
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("content", &self.content)
            .field("middlewares", &self.middlewares)
            .finish_non_exhaustive()
    }
}
