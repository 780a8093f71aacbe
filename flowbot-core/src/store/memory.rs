//! In-memory database adapter.
//!
//! The default backend for tests and token-only deployments. Tracks a
//! mutation counter so idempotence can be asserted from the outside.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    Database, FormEntryRecord, FormEntryUpsert, StepStateCreate, StepStatePatch, StepStateRecord,
    StoreError, UserRecord, UserUpsert,
};

/// Hash-map backed [`Database`] implementation.
#[derive(Default)]
pub struct MemoryDatabase {
    users: Mutex<Vec<UserRecord>>,
    step_states: Mutex<Vec<StepStateRecord>>,
    form_entries: Mutex<Vec<FormEntryRecord>>,
    mutations: AtomicUsize,
}

impl MemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of state-changing writes performed so far. A no-op upsert
    /// (stored data already matches) does not count.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Snapshot of all user records.
    pub async fn users(&self) -> Vec<UserRecord> {
        self.users.lock().await.clone()
    }

    /// Snapshot of all step state records.
    pub async fn step_states(&self) -> Vec<StepStateRecord> {
        self.step_states.lock().await.clone()
    }

    /// Snapshot of all form entry records.
    pub async fn form_entries(&self) -> Vec<FormEntryRecord> {
        self.form_entries.lock().await.clone()
    }

    /// Seed a step state directly, for restart-hydration tests.
    pub async fn insert_step_state(&self, record: StepStateRecord) {
        self.step_states.lock().await.push(record);
    }

    /// Seed a user directly.
    pub async fn insert_user(&self, record: UserRecord) {
        self.users.lock().await.push(record);
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn upsert_user(&self, upsert: UserUpsert) -> Result<UserRecord, StoreError> {
        let mut users = self.users.lock().await;
        if let Some(existing) = users
            .iter_mut()
            .find(|u| u.telegram_id == upsert.telegram_id)
        {
            let unchanged = existing.chat_id == upsert.chat_id
                && existing.username == upsert.username
                && existing.first_name == upsert.first_name
                && existing.last_name == upsert.last_name
                && existing.language_code == upsert.language_code;
            if !unchanged {
                existing.chat_id = upsert.chat_id;
                existing.username = upsert.username;
                existing.first_name = upsert.first_name;
                existing.last_name = upsert.last_name;
                existing.language_code = upsert.language_code;
                existing.updated_at = Utc::now();
                self.mutated();
            }
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let record = UserRecord {
            id: Uuid::now_v7(),
            telegram_id: upsert.telegram_id,
            chat_id: upsert.chat_id,
            username: upsert.username,
            first_name: upsert.first_name,
            last_name: upsert.last_name,
            language_code: upsert.language_code,
            created_at: now,
            updated_at: now,
        };
        users.push(record.clone());
        self.mutated();
        Ok(record)
    }

    async fn find_step_state(
        &self,
        user_id: Uuid,
        slug: &str,
    ) -> Result<Option<StepStateRecord>, StoreError> {
        let states = self.step_states.lock().await;
        Ok(states
            .iter()
            .find(|s| s.user_id == user_id && s.slug == slug)
            .cloned())
    }

    async fn create_step_state(
        &self,
        create: StepStateCreate,
    ) -> Result<StepStateRecord, StoreError> {
        let mut states = self.step_states.lock().await;
        if states
            .iter()
            .any(|s| s.user_id == create.user_id && s.slug == create.slug)
        {
            return Err(StoreError::Database(format!(
                "step state already exists for user {} slug '{}'",
                create.user_id, create.slug
            )));
        }

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
        states.push(record.clone());
        self.mutated();
        Ok(record)
    }

    async fn update_step_state(
        &self,
        id: Uuid,
        patch: StepStatePatch,
    ) -> Result<StepStateRecord, StoreError> {
        let mut states = self.step_states.lock().await;
        let record = states
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::NotFound(id))?;

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
        self.mutated();
        Ok(record.clone())
    }

    async fn upsert_form_entry(
        &self,
        upsert: FormEntryUpsert,
    ) -> Result<FormEntryRecord, StoreError> {
        let mut entries = self.form_entries.lock().await;
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.step_state_id == upsert.step_state_id && e.page_id == upsert.page_id)
        {
            if existing.payload != upsert.payload {
                existing.payload = upsert.payload;
                self.mutated();
            }
            return Ok(existing.clone());
        }

        let record = FormEntryRecord {
            id: Uuid::now_v7(),
            user_id: upsert.user_id,
            step_state_id: upsert.step_state_id,
            slug: upsert.slug,
            page_id: upsert.page_id,
            payload: upsert.payload,
            created_at: Utc::now(),
        };
        entries.push(record.clone());
        self.mutated();
        Ok(record)
    }
}
