//! Database port for conversation persistence.
//!
//! Provides the [`Database`] trait as a port for storage implementations,
//! along with the persisted record types, the in-memory adapter, and the
//! SQLite adapter.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryDatabase;
pub use sqlite::SqliteDatabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::value::HistoryEntry;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// The requested record was not found.
    #[error("record not found: {0}")]
    NotFound(Uuid),

    /// Invalid data was encountered in a stored row.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// A persisted chat-platform user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    /// Internal record id.
    pub id: Uuid,
    /// Platform user id. Unique.
    pub telegram_id: i64,
    /// Last chat the user was seen in.
    pub chat_id: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The per-user, per-slug conversation progress record.
#[derive(Debug, Clone, PartialEq)]
pub struct StepStateRecord {
    /// Internal record id.
    pub id: Uuid,
    /// Owning user record.
    pub user_id: Uuid,
    /// Chat the progress belongs to.
    pub chat_id: String,
    /// Partition key within shared tables. Unique together with `user_id`.
    pub slug: String,
    /// The page the chat currently sits on, if any.
    pub current_page: Option<String>,
    /// Accepted answers keyed by page id.
    pub answers: Map<String, Value>,
    /// Append-only submission history.
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-page submission mirror, unique per `(step_state_id, page_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FormEntryRecord {
    /// Internal record id.
    pub id: Uuid,
    /// Denormalized owner, for operator queries.
    pub user_id: Uuid,
    /// Owning step state record.
    pub step_state_id: Uuid,
    pub slug: String,
    pub page_id: String,
    /// The most recent accepted submission for the pair.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Profile fields applied when upserting a user by platform id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserUpsert {
    pub telegram_id: i64,
    pub chat_id: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
}

/// Fields for creating a fresh step state.
#[derive(Debug, Clone)]
pub struct StepStateCreate {
    pub user_id: Uuid,
    pub chat_id: String,
    pub slug: String,
    pub current_page: Option<String>,
    pub answers: Map<String, Value>,
    pub history: Vec<HistoryEntry>,
}

/// A partial update for a step state. Only set fields are written.
///
/// `current_page` is doubly optional: the outer `Option` marks the field for
/// update, the inner one is the new value (clearing uses `Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct StepStatePatch {
    pub chat_id: Option<String>,
    pub current_page: Option<Option<String>>,
    pub answers: Option<Map<String, Value>>,
    pub history: Option<Vec<HistoryEntry>>,
}

impl StepStatePatch {
    /// True when no field is set — callers skip the round-trip entirely.
    pub fn is_empty(&self) -> bool {
        self.chat_id.is_none()
            && self.current_page.is_none()
            && self.answers.is_none()
            && self.history.is_none()
    }
}

/// Fields for upserting a form entry by `(step_state_id, page_id)`.
#[derive(Debug, Clone)]
pub struct FormEntryUpsert {
    pub user_id: Uuid,
    pub step_state_id: Uuid,
    pub slug: String,
    pub page_id: String,
    pub payload: Value,
}

/// Port for conversation persistence backends.
///
/// Exactly five operations; everything the persistence gateway does is built
/// from them. Uniqueness constraints: `UserRecord.telegram_id`,
/// `(StepStateRecord.user_id, slug)`, `(FormEntryRecord.step_state_id, page_id)`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Insert or update a user by platform id, returning the fresh record.
    ///
    /// Implementations skip the write when the stored profile already
    /// matches the upsert (`created_at`/`updated_at` untouched in that case).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the statement fails.
    async fn upsert_user(&self, upsert: UserUpsert) -> Result<UserRecord, StoreError>;

    /// Look up the step state for `(user_id, slug)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn find_step_state(
        &self,
        user_id: Uuid,
        slug: &str,
    ) -> Result<Option<StepStateRecord>, StoreError>;

    /// Create a fresh step state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails (including
    /// uniqueness violations on `(user_id, slug)`).
    async fn create_step_state(
        &self,
        create: StepStateCreate,
    ) -> Result<StepStateRecord, StoreError>;

    /// Apply a partial update to a step state, returning the updated record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no record has that id.
    /// Returns [`StoreError::Database`] if the update fails.
    async fn update_step_state(
        &self,
        id: Uuid,
        patch: StepStatePatch,
    ) -> Result<StepStateRecord, StoreError>;

    /// Insert or replace the submission mirror for `(step_state_id, page_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the statement fails.
    async fn upsert_form_entry(
        &self,
        upsert: FormEntryUpsert,
    ) -> Result<FormEntryRecord, StoreError>;
}
