//! Bot runtime.
//!
//! Composes the session manager, persistence gateway, page navigator, and
//! middleware pipeline around one transport client, and drives the per-chat
//! state machine for every inbound message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::{Context, SessionData, Services};
use crate::gateway::{DatabaseGateway, DatabaseState, NoopGateway, PersistenceGateway};
use crate::message::{IncomingMessage, TelegramUser};
use crate::messages::MessageTable;
use crate::middleware::{
    ContextFactory, ErrorHook, build_pipeline, merge_middleware_configs, sort_middleware_configs,
};
use crate::navigator::{NavigatorError, PageNavigator};
use crate::options::NormalizedBotOptions;
use crate::session::{ChatSessionState, MemorySessionStorage, SessionError, SessionManager};
use crate::store::StoreError;
use crate::transport::{
    EventPayload, SendOptions, Transport, TransportError, TransportFactory, event,
};

/// Errors escaping the message-step boundary. The runtime logs them and
/// drops the update; the user can message again.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Navigator(#[from] NavigatorError),

    /// Programmatic navigation targeted an unregistered page.
    #[error("page '{0}' is not registered")]
    PageNotFound(String),

    /// Programmatic navigation with no page to start from.
    #[error("no initial page is registered")]
    NoInitialPage,

    /// A page's `on_valid` side effect failed.
    #[error("side effect for page '{page_id}' failed: {reason}")]
    SideEffect {
        /// Page whose side effect failed.
        page_id: String,
        /// The side effect's error description.
        reason: String,
    },
}

/// Options for programmatic navigation (`go_to_page`).
#[derive(Clone, Default)]
pub struct NavigateOptions {
    /// Clear the chat's session data before navigating.
    pub reset_state: bool,
    /// Entries merged into the session data before rendering.
    pub state: Option<Map<String, Value>>,
    /// Message exposed to the render context.
    pub message: Option<IncomingMessage>,
    /// Caller-supplied metadata exposed to the render context.
    pub metadata: Option<Value>,
    /// User recorded on the session before rendering.
    pub user: Option<TelegramUser>,
}

/// Per-chat cooperative locks, so one chat's messages are processed in
/// order while different chats proceed in parallel. Idle entries are
/// evicted opportunistically on the next acquire.
#[derive(Default)]
struct ChatLocks {
    map: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatLocks {
    async fn acquire(&self, chat_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.map.lock().expect("chat lock map poisoned");
            map.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(
                map.entry(chat_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

/// One configured bot: a transport client plus the subsystems driving its
/// page graph.
pub struct BotRuntime {
    id: String,
    transport: Arc<dyn Transport>,
    sessions: SessionManager,
    gateway: Arc<dyn PersistenceGateway>,
    navigator: PageNavigator,
    messages: Arc<MessageTable>,
    services: Services,
    chat_locks: ChatLocks,
}

impl BotRuntime {
    /// Construct a runtime from normalized options: create the transport
    /// from the token, wire up the navigator, and install the message
    /// listener plus every configured handler pipeline.
    pub fn new(
        options: NormalizedBotOptions,
        factory: &dyn TransportFactory,
        messages: Arc<MessageTable>,
    ) -> Arc<Self> {
        let transport = factory.create(&options.token);

        let storage = options
            .session_storage
            .unwrap_or_else(|| Arc::new(MemorySessionStorage::new()));

        let gateway: Arc<dyn PersistenceGateway> = match options.database {
            Some(database) => Arc::new(DatabaseGateway::new(database, options.slug.clone())),
            None => Arc::new(NoopGateway),
        };

        let navigator = PageNavigator::new(Arc::clone(&messages), options.initial_page_id);
        navigator.register_page_middlewares(options.page_middlewares);
        navigator.register_keyboards(options.keyboards);
        navigator.register_pages(options.pages);

        let runtime = Arc::new(Self {
            id: options.id,
            transport,
            sessions: SessionManager::new(storage),
            gateway,
            navigator,
            messages: Arc::clone(&messages),
            services: Arc::new(options.services),
            chat_locks: ChatLocks::default(),
        });

        runtime.install_message_listener();
        runtime.install_handlers(options.handlers, options.middlewares);

        tracing::info!("{}", messages.runtime_initialized(&runtime.id));
        runtime
    }

    /// The bot id this runtime was registered under.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The transport client owned by this runtime.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// The current session state for a chat, for operator inspection.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the session backend fails.
    pub async fn session_state(&self, chat_id: &str) -> Result<ChatSessionState, SessionError> {
        self.sessions.get_session(chat_id).await
    }

    /// Stop the transport's polling loop. Failures are logged, not raised.
    pub async fn stop(&self) {
        if let Err(error) = self.transport.stop_polling().await {
            tracing::warn!("Failed to stop polling for bot '{}': {}", self.id, error);
        }
    }

    fn install_message_listener(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.transport.on(
            event::MESSAGE,
            Arc::new(move |payload: EventPayload| {
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    let Some(runtime) = weak.upgrade() else {
                        return;
                    };
                    let Some(message) = payload.message else {
                        return;
                    };
                    let chat_id = message.chat_key();
                    if let Err(error) = runtime.handle_message(message).await {
                        tracing::error!(
                            "{}",
                            runtime
                                .messages
                                .message_handling_error(&chat_id, &error.to_string())
                        );
                    }
                })
            }),
        );
    }

    fn install_handlers(
        self: &Arc<Self>,
        handlers: Vec<crate::options::Handler>,
        global: Vec<crate::middleware::MiddlewareConfig>,
    ) {
        let global = sort_middleware_configs(global);

        for handler in handlers {
            if handler.event.trim().is_empty() {
                tracing::warn!("{}", self.messages.invalid_handler(&handler.event));
                continue;
            }
            let Some(listener) = handler.listener else {
                tracing::warn!("{}", self.messages.handler_missing_listener(&handler.event));
                continue;
            };

            let merged = merge_middleware_configs(
                global.clone(),
                sort_middleware_configs(handler.middlewares),
            );

            let weak = Arc::downgrade(self);
            let factory: ContextFactory = Arc::new(move |payload: EventPayload| {
                let weak = Weak::clone(&weak);
                Box::pin(async move {
                    let runtime = weak
                        .upgrade()
                        .ok_or_else(|| crate::BoxError::from("runtime dropped"))?;
                    runtime.event_context(payload).await
                })
            });

            let event_name = handler.event.clone();
            let messages = Arc::clone(&self.messages);
            let on_error: ErrorHook = Arc::new(move |error| {
                tracing::error!(
                    "{}",
                    messages.middleware_error(&event_name, &error.to_string())
                );
            });

            let pipeline = build_pipeline(merged, factory, listener, on_error);
            self.transport.on(
                &handler.event,
                Arc::new(move |payload: EventPayload| {
                    let pipeline = Arc::clone(&pipeline);
                    Box::pin(async move {
                        // Failures were already reported through the hook.
                        let _ = pipeline(payload).await;
                    })
                }),
            );
        }
    }

    /// Context for a handler pipeline event.
    async fn event_context(&self, payload: EventPayload) -> Result<Context, crate::BoxError> {
        let chat_id = payload
            .message
            .as_ref()
            .map(IncomingMessage::chat_key)
            .unwrap_or_default();

        let session = if chat_id.is_empty() {
            ChatSessionState::empty()
        } else {
            self.sessions.get_session(&chat_id).await?
        };

        Ok(self.context(
            &chat_id,
            payload.message,
            None,
            SessionData::new(session.data.clone()),
            session.user,
        ))
    }

    fn context(
        &self,
        chat_id: &str,
        message: Option<IncomingMessage>,
        metadata: Option<Value>,
        state: SessionData,
        user: Option<TelegramUser>,
    ) -> Context {
        Context {
            bot_id: self.id.clone(),
            chat_id: chat_id.to_string(),
            transport: Arc::clone(&self.transport),
            message,
            metadata,
            state,
            user,
            persistence: Arc::clone(&self.gateway),
            services: Arc::clone(&self.services),
        }
    }

    /// Process one inbound message.
    ///
    /// Work for the same chat is serialized; errors escape to the caller
    /// (the installed listener logs and drops them).
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when a subsystem fails mid-step.
    pub async fn handle_message(&self, message: IncomingMessage) -> Result<(), RuntimeError> {
        let chat_id = message.chat_key();
        let _guard = self.chat_locks.acquire(&chat_id).await;
        self.message_step(&chat_id, message).await
    }

    /// The per-message state machine.
    async fn message_step(
        &self,
        chat_id: &str,
        message: IncomingMessage,
    ) -> Result<(), RuntimeError> {
        // Step 1: load the session; remember the sender.
        let mut session = self.sessions.get_session(chat_id).await?;
        let mut session_changed = false;
        if let Some(from) = &message.from
            && session.user.as_ref() != Some(from)
        {
            session.user = Some(from.clone());
            session_changed = true;
        }

        // Step 2: ensure persisted records exist and match.
        let mut db = self
            .gateway
            .ensure_database_state(chat_id, &session, Some(&message), session.page_id.as_deref())
            .await?;

        // Step 3: hydrate from the persisted step state. Persisted answers
        // fill only keys absent from memory; fresh in-memory values win.
        if let Some(step) = &db.step_state {
            if session.page_id != step.current_page {
                session.page_id = step.current_page.clone();
                session_changed = true;
            }
            for (key, value) in &step.answers {
                if !session.data.contains_key(key) {
                    session.data.insert(key.clone(), value.clone());
                    session_changed = true;
                }
            }
        }
        if session_changed {
            self.sessions.save_session(chat_id, &session).await?;
        }

        // Shared session-data handle for every context built in this step.
        let state = SessionData::new(session.data.clone());

        // Step 4: no current page — enter the initial page and stop.
        if session.page_id.is_none() {
            let Some(initial) = self.navigator.resolve_initial_page() else {
                tracing::warn!("{}", self.messages.no_initial_page(chat_id));
                return Ok(());
            };
            session.page_id = Some(initial.id.clone());
            self.sessions.save_session(chat_id, &session).await?;
            db.step_state = self
                .gateway
                .update_current_page(db.step_state.take(), Some(&initial.id))
                .await?;

            let ctx = self.context(
                chat_id,
                Some(message),
                None,
                state.clone(),
                session.user.clone(),
            );
            let rendered = self.navigator.render_page(&initial, ctx).await?;
            if rendered != initial.id {
                session.page_id = Some(rendered.clone());
                self.sessions.save_session(chat_id, &session).await?;
                self.gateway
                    .update_current_page(db.step_state.take(), Some(&rendered))
                    .await?;
            }
            return Ok(());
        }

        // Step 5: resolve the current page; a dangling id resets the chat.
        let current_id = session.page_id.clone().unwrap_or_default();
        let Some(current) = self.navigator.resolve_page(&current_id) else {
            tracing::warn!("{}", self.messages.page_not_found(&current_id, chat_id));
            self.clear_position(chat_id, &mut session, &mut db).await?;
            return Ok(());
        };

        // Step 6: extract and validate the submitted value.
        let value = self.navigator.extract_message_value(&message);
        let ctx = self.context(
            chat_id,
            Some(message.clone()),
            None,
            state.clone(),
            session.user.clone(),
        );
        let validation = self
            .navigator
            .validate_page_value(&current, &value, ctx.clone())
            .await;

        // Step 7: rejection — report, re-render (or redirect), no advance.
        if !validation.valid {
            let redirect_target = validation
                .redirect_to
                .as_ref()
                .filter(|t| **t != current.id)
                .and_then(|t| self.navigator.resolve_page(t));
            if let Some(target) = redirect_target {
                if let Some(text) = &validation.message {
                    self.transport
                        .send_message(chat_id, text, SendOptions::default())
                        .await?;
                }
                let rendered = self.navigator.render_page(&target, ctx).await?;
                session.page_id = Some(rendered.clone());
                self.sessions.save_session(chat_id, &session).await?;
                self.gateway
                    .update_current_page(db.step_state.take(), Some(&rendered))
                    .await?;
                return Ok(());
            }

            let text = validation
                .message
                .clone()
                .unwrap_or_else(|| self.messages.validation_failed.clone());
            self.transport
                .send_message(chat_id, &text, SendOptions::default())
                .await?;

            let bare_ctx =
                self.context(chat_id, None, None, state.clone(), session.user.clone());
            self.navigator.render_page(&current, bare_ctx).await?;
            return Ok(());
        }

        // Step 8: record the accepted answer in session and persistence.
        let accepted = validation.save_value.unwrap_or(value);
        state.set(current.id.clone(), accepted.clone());
        session.data = state.snapshot();
        self.sessions.save_session(chat_id, &session).await?;
        db.step_state = self
            .gateway
            .persist_step_progress(db.step_state.take(), &current.id, &accepted)
            .await?;

        // Step 9: run the page's side effect.
        if let Some(on_valid) = &current.on_valid {
            on_valid(ctx.clone())
                .await
                .map_err(|e| RuntimeError::SideEffect {
                    page_id: current.id.clone(),
                    reason: e.to_string(),
                })?;
        }

        // Step 10: mirror session data (including derived slots) into the
        // step state.
        let after_effects = state.snapshot();
        if after_effects != session.data {
            session.data = after_effects;
            self.sessions.save_session(chat_id, &session).await?;
        }
        db.step_state = self
            .gateway
            .sync_session_state(db.step_state.take(), &session.data)
            .await?;

        // Step 11: resolve the successor; none means the flow is complete.
        let Some(next_id) = self.navigator.resolve_next_page_id(&current, ctx).await else {
            self.clear_position(chat_id, &mut session, &mut db).await?;
            return Ok(());
        };

        // Step 12: advance and render, honoring render-time redirects.
        let Some(next_page) = self.navigator.resolve_page(&next_id) else {
            tracing::warn!("{}", self.messages.next_page_not_found(&next_id, chat_id));
            self.clear_position(chat_id, &mut session, &mut db).await?;
            return Ok(());
        };

        session.page_id = Some(next_page.id.clone());
        self.sessions.save_session(chat_id, &session).await?;
        db.step_state = self
            .gateway
            .update_current_page(db.step_state.take(), Some(&next_page.id))
            .await?;

        let render_ctx = self.context(
            chat_id,
            Some(message),
            None,
            state.clone(),
            session.user.clone(),
        );
        let rendered = self.navigator.render_page(&next_page, render_ctx).await?;
        if rendered != next_page.id {
            session.page_id = Some(rendered.clone());
            self.sessions.save_session(chat_id, &session).await?;
            self.gateway
                .update_current_page(db.step_state.take(), Some(&rendered))
                .await?;
        }

        Ok(())
    }

    async fn clear_position(
        &self,
        chat_id: &str,
        session: &mut ChatSessionState,
        db: &mut DatabaseState,
    ) -> Result<(), RuntimeError> {
        session.page_id = None;
        self.sessions.save_session(chat_id, session).await?;
        db.step_state = self
            .gateway
            .update_current_page(db.step_state.take(), None)
            .await?;
        Ok(())
    }

    /// Drive a chat to a page out-of-band and render it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::PageNotFound`] for an unregistered target,
    /// or any subsystem failure.
    pub async fn go_to_page(
        &self,
        chat_id: &str,
        page_id: &str,
        options: NavigateOptions,
    ) -> Result<(), RuntimeError> {
        let _guard = self.chat_locks.acquire(chat_id).await;

        let page = self
            .navigator
            .resolve_page(page_id)
            .ok_or_else(|| RuntimeError::PageNotFound(page_id.to_string()))?;

        let mut session = self.sessions.get_session(chat_id).await?;
        if options.reset_state {
            session.data.clear();
        }
        if let Some(patch) = options.state {
            for (key, value) in patch {
                session.data.insert(key, value);
            }
        }
        if let Some(user) = options.user {
            session.user = Some(user);
        }

        let mut db = self
            .gateway
            .ensure_database_state(chat_id, &session, options.message.as_ref(), Some(&page.id))
            .await?;

        session.page_id = Some(page.id.clone());
        self.sessions.save_session(chat_id, &session).await?;
        db.step_state = self
            .gateway
            .update_current_page(db.step_state.take(), Some(&page.id))
            .await?;

        let state = SessionData::new(session.data.clone());
        let ctx = self.context(
            chat_id,
            options.message,
            options.metadata,
            state.clone(),
            session.user.clone(),
        );
        let rendered = self.navigator.render_page(&page, ctx).await?;

        let after_render = state.snapshot();
        if after_render != session.data {
            session.data = after_render;
            self.sessions.save_session(chat_id, &session).await?;
        }
        if rendered != page.id {
            session.page_id = Some(rendered.clone());
            self.sessions.save_session(chat_id, &session).await?;
            self.gateway
                .update_current_page(db.step_state.take(), Some(&rendered))
                .await?;
        }

        Ok(())
    }

    /// Drive a chat to the initial page.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoInitialPage`] when no page is registered.
    pub async fn go_to_initial_page(
        &self,
        chat_id: &str,
        options: NavigateOptions,
    ) -> Result<(), RuntimeError> {
        let initial = self
            .navigator
            .resolve_initial_page()
            .ok_or(RuntimeError::NoInitialPage)?;
        let initial_id = initial.id.clone();
        self.go_to_page(chat_id, &initial_id, options).await
    }
}
