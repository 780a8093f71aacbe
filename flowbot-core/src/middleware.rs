//! Handler middleware pipeline.
//!
//! Wraps a handler listener in a priority-ordered chain of interceptors.
//! Each middleware receives the context and a [`Next`] continuation; the
//! terminal handler runs only after every middleware has passed control on.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::BoxError;
use crate::context::Context;
use crate::transport::EventPayload;

/// A handler middleware. Call `next.run(ctx)` to pass control on; returning
/// without calling it short-circuits the chain.
pub type MiddlewareFn =
    Arc<dyn Fn(Context, Next) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Terminal handler invoked after the whole chain allowed the event through.
/// Receives the (possibly replaced) context and the original event payload.
pub type HandlerFn = Arc<
    dyn Fn(Context, EventPayload) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync,
>;

/// Async factory building the context for one event.
pub type ContextFactory =
    Arc<dyn Fn(EventPayload) -> BoxFuture<'static, Result<Context, BoxError>> + Send + Sync>;

/// Hook observing pipeline failures before they are re-raised.
pub type ErrorHook = Arc<dyn Fn(&BoxError) + Send + Sync>;

/// The compiled pipeline: a callable taking the raw event payload.
pub type PipelineFn =
    Arc<dyn Fn(EventPayload) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// A middleware declaration with an evaluation priority.
#[derive(Clone)]
pub struct MiddlewareConfig {
    pub name: Option<String>,
    /// Higher runs earlier. Defaults to 0.
    pub priority: i32,
    pub handler: MiddlewareFn,
}

impl MiddlewareConfig {
    pub fn new(handler: MiddlewareFn) -> Self {
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

impl fmt::Debug for MiddlewareConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareConfig")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Wrap a plain async closure into a [`MiddlewareFn`].
pub fn middleware_fn<F, Fut>(f: F) -> MiddlewareFn
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx, next| Box::pin(f(ctx, next)))
}

/// Wrap a plain async closure into a [`HandlerFn`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Context, EventPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx, payload| Box::pin(f(ctx, payload)))
}

/// Continuation handed to each middleware.
///
/// Consumed by value, so a middleware can run the rest of the chain at most
/// once; dropping it without calling short-circuits the pipeline.
pub struct Next {
    remaining: VecDeque<MiddlewareConfig>,
    terminal: HandlerFn,
    payload: EventPayload,
}

impl Next {
    /// Run the rest of the chain, then the terminal handler.
    ///
    /// # Errors
    ///
    /// Propagates the first failure from a downstream middleware or the
    /// terminal handler.
    pub fn run(mut self, ctx: Context) -> BoxFuture<'static, Result<(), BoxError>> {
        Box::pin(async move {
            match self.remaining.pop_front() {
                Some(config) => (config.handler)(ctx, self).await,
                None => (self.terminal)(ctx, self.payload).await,
            }
        })
    }
}

/// Sort middlewares by descending priority, keeping declaration order for
/// equal priorities.
pub fn sort_middleware_configs(mut configs: Vec<MiddlewareConfig>) -> Vec<MiddlewareConfig> {
    configs.sort_by(|a, b| b.priority.cmp(&a.priority));
    configs
}

/// Merge two already-sorted lists, preserving descending priority.
/// Equal priorities favor the global (first) list.
pub fn merge_middleware_configs(
    global: Vec<MiddlewareConfig>,
    handler: Vec<MiddlewareConfig>,
) -> Vec<MiddlewareConfig> {
    let mut merged = Vec::with_capacity(global.len() + handler.len());
    let mut global = VecDeque::from(global);
    let mut handler = VecDeque::from(handler);

    loop {
        let take_handler = match (global.front(), handler.front()) {
            (Some(g), Some(h)) => h.priority > g.priority,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_handler {
            handler.pop_front()
        } else {
            global.pop_front()
        };
        if let Some(config) = next {
            merged.push(config);
        }
    }

    merged
}

/// Compile a middleware chain around a handler listener.
///
/// The returned function builds a context for the incoming payload, runs the
/// middlewares in order, and finally the handler. Any failure is passed to
/// `on_error` and re-raised.
pub fn build_pipeline(
    middlewares: Vec<MiddlewareConfig>,
    context_factory: ContextFactory,
    handler: HandlerFn,
    on_error: ErrorHook,
) -> PipelineFn {
    Arc::new(move |payload: EventPayload| {
        let middlewares = middlewares.clone();
        let context_factory = Arc::clone(&context_factory);
        let handler = Arc::clone(&handler);
        let on_error = Arc::clone(&on_error);
        Box::pin(async move {
            let result = async {
                let ctx = context_factory(payload.clone()).await?;
                let next = Next {
                    remaining: VecDeque::from(middlewares),
                    terminal: handler,
                    payload,
                };
                next.run(ctx).await
            }
            .await;

            if let Err(error) = &result {
                on_error(error);
            }
            result
        })
    })
}
