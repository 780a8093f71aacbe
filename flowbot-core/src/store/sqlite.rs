//! SQLite database adapter.
//!
//! Provides [`SqliteDatabase`] as the default file-backed [`Database`]
//! implementation. Uses connection pooling and WAL mode.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use super::{
    Database, FormEntryRecord, FormEntryUpsert, StepStateCreate, StepStatePatch, StepStateRecord,
    StoreError, UserRecord, UserUpsert,
};
use crate::value::{history_to_value, normalize_answers, normalize_history};

/// Table definitions for the conversation store.
///
/// Applied with `CREATE TABLE IF NOT EXISTS` by [`SqliteDatabase::ensure_schema`];
/// operators running another database bring their own equivalent schema.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    telegram_id INTEGER NOT NULL UNIQUE,
    chat_id TEXT,
    username TEXT,
    first_name TEXT,
    last_name TEXT,
    language_code TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS step_states (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    chat_id TEXT NOT NULL,
    slug TEXT NOT NULL,
    current_page TEXT,
    answers TEXT NOT NULL,
    history TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, slug)
);

CREATE TABLE IF NOT EXISTS form_entries (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    step_state_id TEXT NOT NULL REFERENCES step_states(id) ON DELETE CASCADE,
    slug TEXT NOT NULL,
    page_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (step_state_id, page_id)
);
"#;

/// SQLite-backed conversation store.
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Create a new store from a database URL.
    ///
    /// The URL should be in the format `sqlite:path/to/database.db`.
    /// Applies the schema and enables WAL mode.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if connection or schema setup fails.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        // Ensure parent directory exists
        let path = PathBuf::from(url);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("failed to create database directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(url)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Apply the table definitions (idempotent).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a statement fails.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        Ok(())
    }

    fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
        Uuid::parse_str(raw).map_err(|e| StoreError::InvalidData(format!("invalid UUID: {}", e)))
    }

    fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::InvalidData(format!("invalid datetime: {}", e)))
    }

    fn parse_json(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap_or(Value::Null)
    }

    fn user_from_row(row: &SqliteRow) -> Result<UserRecord, StoreError> {
        let id: String = row.get("id");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        Ok(UserRecord {
            id: Self::parse_uuid(&id)?,
            telegram_id: row.get("telegram_id"),
            chat_id: row.get("chat_id"),
            username: row.get("username"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            language_code: row.get("language_code"),
            created_at: Self::parse_datetime(&created_at)?,
            updated_at: Self::parse_datetime(&updated_at)?,
        })
    }

    fn step_state_from_row(row: &SqliteRow) -> Result<StepStateRecord, StoreError> {
        let id: String = row.get("id");
        let user_id: String = row.get("user_id");
        let answers_raw: String = row.get("answers");
        let history_raw: String = row.get("history");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        Ok(StepStateRecord {
            id: Self::parse_uuid(&id)?,
            user_id: Self::parse_uuid(&user_id)?,
            chat_id: row.get("chat_id"),
            slug: row.get("slug"),
            current_page: row.get("current_page"),
            answers: normalize_answers(Some(&Self::parse_json(&answers_raw))),
            history: normalize_history(Some(&Self::parse_json(&history_raw))),
            created_at: Self::parse_datetime(&created_at)?,
            updated_at: Self::parse_datetime(&updated_at)?,
        })
    }

    fn form_entry_from_row(row: &SqliteRow) -> Result<FormEntryRecord, StoreError> {
        let id: String = row.get("id");
        let user_id: String = row.get("user_id");
        let step_state_id: String = row.get("step_state_id");
        let payload_raw: String = row.get("payload");
        let created_at: String = row.get("created_at");
        Ok(FormEntryRecord {
            id: Self::parse_uuid(&id)?,
            user_id: Self::parse_uuid(&user_id)?,
            step_state_id: Self::parse_uuid(&step_state_id)?,
            slug: row.get("slug"),
            page_id: row.get("page_id"),
            payload: Self::parse_json(&payload_raw),
            created_at: Self::parse_datetime(&created_at)?,
        })
    }

    fn answers_to_string(answers: &serde_json::Map<String, Value>) -> String {
        Value::Object(answers.clone()).to_string()
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn upsert_user(&self, upsert: UserUpsert) -> Result<UserRecord, StoreError> {
        let now = Utc::now().to_rfc3339();
        // The DO UPDATE is guarded so an identical profile leaves the row
        // (and its updated_at) untouched.
        sqlx::query(
            r#"
            INSERT INTO users (id, telegram_id, chat_id, username, first_name, last_name, language_code, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (telegram_id) DO UPDATE SET
                chat_id = excluded.chat_id,
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                language_code = excluded.language_code,
                updated_at = excluded.updated_at
            WHERE users.chat_id IS NOT excluded.chat_id
               OR users.username IS NOT excluded.username
               OR users.first_name IS NOT excluded.first_name
               OR users.last_name IS NOT excluded.last_name
               OR users.language_code IS NOT excluded.language_code
            "#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(upsert.telegram_id)
        .bind(&upsert.chat_id)
        .bind(&upsert.username)
        .bind(&upsert.first_name)
        .bind(&upsert.last_name)
        .bind(&upsert.language_code)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT id, telegram_id, chat_id, username, first_name, last_name, language_code, created_at, updated_at
            FROM users
            WHERE telegram_id = ?
            "#,
        )
        .bind(upsert.telegram_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Self::user_from_row(&row)
    }

    async fn find_step_state(
        &self,
        user_id: Uuid,
        slug: &str,
    ) -> Result<Option<StepStateRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, chat_id, slug, current_page, answers, history, created_at, updated_at
            FROM step_states
            WHERE user_id = ? AND slug = ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(slug)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(Self::step_state_from_row).transpose()
    }

    async fn create_step_state(
        &self,
        create: StepStateCreate,
    ) -> Result<StepStateRecord, StoreError> {
        let now = Utc::now();
        let record = StepStateRecord {
            id: Uuid::now_v7(),
            user_id: create.user_id,
            chat_id: create.chat_id,
            slug: create.slug,
            current_page: create.current_page,
            answers: create.answers,
            history: create.history,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO step_states (id, user_id, chat_id, slug, current_page, answers, history, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.user_id.to_string())
        .bind(&record.chat_id)
        .bind(&record.slug)
        .bind(&record.current_page)
        .bind(Self::answers_to_string(&record.answers))
        .bind(history_to_value(&record.history).to_string())
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(record)
    }

    async fn update_step_state(
        &self,
        id: Uuid,
        patch: StepStatePatch,
    ) -> Result<StepStateRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, chat_id, slug, current_page, answers, history, created_at, updated_at
            FROM step_states
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::NotFound(id))?;

        let mut record = Self::step_state_from_row(&row)?;
        if let Some(chat_id) = patch.chat_id {
            record.chat_id = chat_id;
        }
        if let Some(current_page) = patch.current_page {
            record.current_page = current_page;
        }
        if let Some(answers) = patch.answers {
            record.answers = answers;
        }
        if let Some(history) = patch.history {
            record.history = history;
        }
        record.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE step_states
            SET chat_id = ?, current_page = ?, answers = ?, history = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.chat_id)
        .bind(&record.current_page)
        .bind(Self::answers_to_string(&record.answers))
        .bind(history_to_value(&record.history).to_string())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(record)
    }

    async fn upsert_form_entry(
        &self,
        upsert: FormEntryUpsert,
    ) -> Result<FormEntryRecord, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO form_entries (id, user_id, step_state_id, slug, page_id, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (step_state_id, page_id) DO UPDATE SET
                payload = excluded.payload
            "#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(upsert.user_id.to_string())
        .bind(upsert.step_state_id.to_string())
        .bind(&upsert.slug)
        .bind(&upsert.page_id)
        .bind(upsert.payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT id, user_id, step_state_id, slug, page_id, payload, created_at
            FROM form_entries
            WHERE step_state_id = ? AND page_id = ?
            "#,
        )
        .bind(upsert.step_state_id.to_string())
        .bind(&upsert.page_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Self::form_entry_from_row(&row)
    }
}
