//! Flowbot Telegram adapter.
//!
//! Connects the Telegram Bot API to `flowbot-core`: a teloxide-backed
//! implementation of the transport port, TOML configuration loading with
//! token resolution, and tracing setup for deployments.
//!
//! Registering a bot against Telegram takes one factory:
//!
//! ```no_run
//! use std::sync::Arc;
//! use flowbot_core::{BotOptions, BotRegistry, Page};
//! use flowbot_telegram::TeloxideTransportFactory;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = BotRegistry::new(Arc::new(TeloxideTransportFactory));
//! registry
//!     .register_bot(
//!         BotOptions::new("123:token")
//!             .with_id("greeter")
//!             .with_page(Page::new("hello").with_text("Hi there!")),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod transport;

pub use config::{Config, ConfigError, LoggingConfig, TelegramConfig, resolve_bot_token};
pub use logging::init_tracing;
pub use transport::{TeloxideTransport, TeloxideTransportFactory, convert_message};
