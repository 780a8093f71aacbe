//! Flowbot core library.
//!
//! A framework for multi-step conversational bots on chat platforms with
//! long polling. Developers declare a graph of pages — prompt, validator,
//! side effect, successor — and the runtime drives each chat through it,
//! validating input, persisting progress, and rendering replies.
//!
//! The wire transport and the database are consumed as ports
//! ([`transport::Transport`], [`store::Database`]), so the core stays
//! platform-agnostic; adapter crates plug in the concrete clients.

pub mod context;
pub mod gateway;
pub mod message;
pub mod messages;
pub mod middleware;
pub mod navigator;
pub mod options;
pub mod page;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod store;
pub mod transport;
pub mod value;

/// Error type for user-supplied callbacks (validators, side effects,
/// content factories, middlewares).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use context::{Context, SessionData, Services};
pub use gateway::{DatabaseGateway, DatabaseState, NoopGateway, PersistenceGateway};
pub use message::{IncomingChat, IncomingMessage, TelegramUser};
pub use messages::MessageTable;
pub use middleware::{
    MiddlewareConfig, Next, build_pipeline, handler_fn, merge_middleware_configs, middleware_fn,
    sort_middleware_configs,
};
pub use navigator::{NavigatorError, PageNavigator};
pub use options::{BotOptions, Handler, NormalizedBotOptions, normalize_bot_options};
pub use page::{
    Guard, Keyboard, Page, PageContent, PageMiddlewareConfig, PageMiddlewareRef, PagePayload,
    PageSchema, Validation, content_fn, guard_fn, keyboard_fn, next_fn, side_effect_fn,
    validator_fn,
};
pub use registry::{BotRegistry, RegistryError};
pub use runtime::{BotRuntime, NavigateOptions, RuntimeError};
pub use session::{
    ChatSessionState, MemorySessionStorage, SessionError, SessionManager, SessionStorage,
};
pub use store::{
    Database, FormEntryRecord, MemoryDatabase, SqliteDatabase, StepStateRecord, StoreError,
    UserRecord,
};
pub use transport::{
    EventListener, EventPayload, InlineButton, ParseMode, ReplyKeyboard, ReplyMarkup, SendOptions,
    Transport, TransportError, TransportFactory,
};
pub use value::{HistoryEntry, canonicalize, canonicalize_map, normalize_answers, normalize_history};
