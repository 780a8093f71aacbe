//! Persistence gateway.
//!
//! Sits between the bot runtime and the [`Database`] port: idempotent
//! ensure of user + step state, append-only progress recording, session
//! mirroring, and optimistic-skip updates (nothing is written when the
//! stored row already matches).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::message::IncomingMessage;
use crate::session::ChatSessionState;
use crate::store::{
    Database, FormEntryUpsert, StepStateCreate, StepStatePatch, StepStateRecord, StoreError,
    UserRecord, UserUpsert,
};
use crate::value::{HistoryEntry, canonicalize, canonicalize_map};

/// The persisted records backing one chat's conversation.
#[derive(Debug, Clone, Default)]
pub struct DatabaseState {
    pub user: Option<UserRecord>,
    pub step_state: Option<StepStateRecord>,
}

/// Port between the runtime and conversation persistence.
///
/// Every operation passes through when there is nothing to persist against
/// (no database, no resolvable user, no step state), so the runtime never
/// branches on whether persistence is configured.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Ensure user and step state records exist and reflect the session.
    ///
    /// Upserts the user by platform id, then finds or creates the step
    /// state for `(user, slug)`. An existing step state is patched with a
    /// minimal diff: `chat_id` when it moved, `current_page` when
    /// `current_page_id` is given and differs. Calling twice with identical
    /// inputs performs no writes the second time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the database fails.
    async fn ensure_database_state(
        &self,
        chat_id: &str,
        session: &ChatSessionState,
        message: Option<&IncomingMessage>,
        current_page_id: Option<&str>,
    ) -> Result<DatabaseState, StoreError>;

    /// Record an accepted submission: update `answers[page_id]`, append a
    /// history entry, and mirror the value into the form entry for
    /// `(step_state, page_id)`. Pass-through when `step_state` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the database fails.
    async fn persist_step_progress(
        &self,
        step_state: Option<StepStateRecord>,
        page_id: &str,
        value: &Value,
    ) -> Result<Option<StepStateRecord>, StoreError>;

    /// Mirror the full session data into stored `answers`, skipping the
    /// write when the serialized session already deep-equals them. This is
    /// how derived session slots (not tied to a page id) survive restarts.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the database fails.
    async fn sync_session_state(
        &self,
        step_state: Option<StepStateRecord>,
        session_data: &Map<String, Value>,
    ) -> Result<Option<StepStateRecord>, StoreError>;

    /// Move the stored `current_page`, treating an absent `page_id` as a
    /// clear. No-op when the stored value already matches.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the database fails.
    async fn update_current_page(
        &self,
        step_state: Option<StepStateRecord>,
        page_id: Option<&str>,
    ) -> Result<Option<StepStateRecord>, StoreError>;
}

/// Gateway used when no database handle is configured: returns empty state
/// and passes inputs through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGateway;

#[async_trait]
impl PersistenceGateway for NoopGateway {
    async fn ensure_database_state(
        &self,
        _chat_id: &str,
        _session: &ChatSessionState,
        _message: Option<&IncomingMessage>,
        _current_page_id: Option<&str>,
    ) -> Result<DatabaseState, StoreError> {
        Ok(DatabaseState::default())
    }

    async fn persist_step_progress(
        &self,
        step_state: Option<StepStateRecord>,
        _page_id: &str,
        _value: &Value,
    ) -> Result<Option<StepStateRecord>, StoreError> {
        Ok(step_state)
    }

    async fn sync_session_state(
        &self,
        step_state: Option<StepStateRecord>,
        _session_data: &Map<String, Value>,
    ) -> Result<Option<StepStateRecord>, StoreError> {
        Ok(step_state)
    }

    async fn update_current_page(
        &self,
        step_state: Option<StepStateRecord>,
        _page_id: Option<&str>,
    ) -> Result<Option<StepStateRecord>, StoreError> {
        Ok(step_state)
    }
}

/// Gateway over a concrete [`Database`], partitioned by slug.
pub struct DatabaseGateway {
    db: Arc<dyn Database>,
    slug: String,
}

impl DatabaseGateway {
    /// Create a gateway writing step states under the given slug.
    pub fn new(db: Arc<dyn Database>, slug: impl Into<String>) -> Self {
        Self {
            db,
            slug: slug.into(),
        }
    }

    /// The user identity to persist, from the message sender first, the
    /// session's remembered user otherwise.
    fn resolve_user<'a>(
        session: &'a ChatSessionState,
        message: Option<&'a IncomingMessage>,
    ) -> Option<&'a crate::message::TelegramUser> {
        message
            .and_then(|m| m.from.as_ref())
            .or(session.user.as_ref())
    }
}

#[async_trait]
impl PersistenceGateway for DatabaseGateway {
    async fn ensure_database_state(
        &self,
        chat_id: &str,
        session: &ChatSessionState,
        message: Option<&IncomingMessage>,
        current_page_id: Option<&str>,
    ) -> Result<DatabaseState, StoreError> {
        let Some(tg_user) = Self::resolve_user(session, message) else {
            tracing::debug!("No telegram user for chat {}; skipping persistence", chat_id);
            return Ok(DatabaseState::default());
        };

        let user = self
            .db
            .upsert_user(UserUpsert {
                telegram_id: tg_user.id,
                chat_id: Some(chat_id.to_string()),
                username: tg_user.username.clone(),
                first_name: tg_user.first_name.clone(),
                last_name: tg_user.last_name.clone(),
                language_code: tg_user.language_code.clone(),
            })
            .await?;

        let step_state = match self.db.find_step_state(user.id, &self.slug).await? {
            None => {
                let current_page = current_page_id
                    .map(str::to_string)
                    .or_else(|| session.page_id.clone());
                self.db
                    .create_step_state(StepStateCreate {
                        user_id: user.id,
                        chat_id: chat_id.to_string(),
                        slug: self.slug.clone(),
                        current_page,
                        answers: canonicalize_map(&session.data),
                        history: Vec::new(),
                    })
                    .await?
            }
            Some(existing) => {
                let mut patch = StepStatePatch::default();
                if existing.chat_id != chat_id {
                    patch.chat_id = Some(chat_id.to_string());
                }
                if let Some(page_id) = current_page_id {
                    if existing.current_page.as_deref() != Some(page_id) {
                        patch.current_page = Some(Some(page_id.to_string()));
                    }
                }
                if patch.is_empty() {
                    existing
                } else {
                    self.db.update_step_state(existing.id, patch).await?
                }
            }
        };

        Ok(DatabaseState {
            user: Some(user),
            step_state: Some(step_state),
        })
    }

    async fn persist_step_progress(
        &self,
        step_state: Option<StepStateRecord>,
        page_id: &str,
        value: &Value,
    ) -> Result<Option<StepStateRecord>, StoreError> {
        let Some(state) = step_state else {
            return Ok(None);
        };

        let canonical = canonicalize(value);

        let mut answers = state.answers.clone();
        answers.insert(page_id.to_string(), canonical.clone());

        let mut history = state.history.clone();
        history.push(HistoryEntry::new(page_id, &canonical));

        let updated = self
            .db
            .update_step_state(
                state.id,
                StepStatePatch {
                    answers: Some(answers),
                    history: Some(history),
                    ..StepStatePatch::default()
                },
            )
            .await?;

        self.db
            .upsert_form_entry(FormEntryUpsert {
                user_id: updated.user_id,
                step_state_id: updated.id,
                slug: updated.slug.clone(),
                page_id: page_id.to_string(),
                payload: canonical,
            })
            .await?;

        Ok(Some(updated))
    }

    async fn sync_session_state(
        &self,
        step_state: Option<StepStateRecord>,
        session_data: &Map<String, Value>,
    ) -> Result<Option<StepStateRecord>, StoreError> {
        let Some(state) = step_state else {
            return Ok(None);
        };

        let serialized = canonicalize_map(session_data);
        if serialized == state.answers {
            return Ok(Some(state));
        }

        let updated = self
            .db
            .update_step_state(
                state.id,
                StepStatePatch {
                    answers: Some(serialized),
                    ..StepStatePatch::default()
                },
            )
            .await?;
        Ok(Some(updated))
    }

    async fn update_current_page(
        &self,
        step_state: Option<StepStateRecord>,
        page_id: Option<&str>,
    ) -> Result<Option<StepStateRecord>, StoreError> {
        let Some(state) = step_state else {
            return Ok(None);
        };

        if state.current_page.as_deref() == page_id {
            return Ok(Some(state));
        }

        let updated = self
            .db
            .update_step_state(
                state.id,
                StepStatePatch {
                    current_page: Some(page_id.map(str::to_string)),
                    ..StepStatePatch::default()
                },
            )
            .await?;
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::TelegramUser;
    use crate::store::MemoryDatabase;

    fn session_with_user(id: i64) -> ChatSessionState {
        let mut session = ChatSessionState::empty();
        session.user = Some(TelegramUser::new(id));
        session
    }

    fn gateway(db: &Arc<MemoryDatabase>) -> DatabaseGateway {
        DatabaseGateway::new(Arc::clone(db) as Arc<dyn Database>, "default")
    }

    #[tokio::test]
    async fn test_ensure_creates_user_and_step_state() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(42);
        let state = gw
            .ensure_database_state("1", &session, None, Some("intro"))
            .await
            .expect("ensure failed");

        let user = state.user.expect("user should exist");
        assert_eq!(user.telegram_id, 42);
        let step = state.step_state.expect("step state should exist");
        assert_eq!(step.chat_id, "1");
        assert_eq!(step.current_page.as_deref(), Some("intro"));
        assert!(step.history.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_without_user_is_empty() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let state = gw
            .ensure_database_state("1", &ChatSessionState::empty(), None, None)
            .await
            .expect("ensure failed");

        assert!(state.user.is_none());
        assert!(state.step_state.is_none());
        assert_eq!(db.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_ensure_prefers_message_sender_over_session_user() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(1);
        let message = IncomingMessage::text(7, "hi").with_from(TelegramUser::new(2));
        let state = gw
            .ensure_database_state("7", &session, Some(&message), None)
            .await
            .expect("ensure failed");

        assert_eq!(state.user.expect("user").telegram_id, 2);
    }

    #[tokio::test]
    async fn test_ensure_idempotent_second_call_writes_nothing() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(42);
        gw.ensure_database_state("1", &session, None, Some("intro"))
            .await
            .expect("first ensure failed");
        let writes = db.mutation_count();

        let again = gw
            .ensure_database_state("1", &session, None, Some("intro"))
            .await
            .expect("second ensure failed");

        assert_eq!(db.mutation_count(), writes);
        assert!(again.step_state.is_some());
    }

    #[tokio::test]
    async fn test_ensure_minimal_diff_on_chat_move() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(42);
        gw.ensure_database_state("1", &session, None, Some("intro"))
            .await
            .expect("ensure failed");

        let moved = gw
            .ensure_database_state("2", &session, None, Some("intro"))
            .await
            .expect("ensure failed");

        let step = moved.step_state.expect("step state");
        assert_eq!(step.chat_id, "2");
        assert_eq!(step.current_page.as_deref(), Some("intro"));
    }

    #[tokio::test]
    async fn test_ensure_none_page_does_not_clear_stored_page() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(42);
        gw.ensure_database_state("1", &session, None, Some("intro"))
            .await
            .expect("ensure failed");
        let writes = db.mutation_count();

        // No current page supplied: the stored one must survive untouched.
        let state = gw
            .ensure_database_state("1", &session, None, None)
            .await
            .expect("ensure failed");
        assert_eq!(
            state
                .step_state
                .expect("step state")
                .current_page
                .as_deref(),
            Some("intro")
        );
        assert_eq!(db.mutation_count(), writes);
    }

    #[tokio::test]
    async fn test_persist_step_progress_updates_answers_history_and_form() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(42);
        let ensured = gw
            .ensure_database_state("1", &session, None, Some("name"))
            .await
            .expect("ensure failed");

        let updated = gw
            .persist_step_progress(ensured.step_state, "name", &json!("Bob"))
            .await
            .expect("persist failed")
            .expect("step state");

        assert_eq!(updated.answers.get("name"), Some(&json!("Bob")));
        assert_eq!(updated.history.len(), 1);
        assert_eq!(updated.history[0].page_id, "name");
        assert_eq!(updated.history[0].value, json!("Bob"));

        let entries = db.form_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].page_id, "name");
        assert_eq!(entries[0].payload, json!("Bob"));
        assert_eq!(entries[0].user_id, updated.user_id);
    }

    #[tokio::test]
    async fn test_persist_step_progress_history_grows_monotonically() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(42);
        let ensured = gw
            .ensure_database_state("1", &session, None, None)
            .await
            .expect("ensure failed");

        let mut state = ensured.step_state;
        for (i, value) in ["a", "b", "c"].iter().enumerate() {
            state = gw
                .persist_step_progress(state, "page", &json!(value))
                .await
                .expect("persist failed");
            assert_eq!(state.as_ref().expect("state").history.len(), i + 1);
        }

        let history = &state.expect("state").history;
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_persist_step_progress_mirrors_latest_value() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(42);
        let ensured = gw
            .ensure_database_state("1", &session, None, None)
            .await
            .expect("ensure failed");

        let state = gw
            .persist_step_progress(ensured.step_state, "name", &json!("first"))
            .await
            .expect("persist failed");
        let state = gw
            .persist_step_progress(state, "name", &json!("second"))
            .await
            .expect("persist failed")
            .expect("state");

        // Answers and form entry both hold the latest accepted value.
        assert_eq!(state.answers.get("name"), Some(&json!("second")));
        let entries = db.form_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, json!("second"));
        // History kept both submissions.
        assert_eq!(state.history.len(), 2);
    }

    #[tokio::test]
    async fn test_persist_step_progress_canonicalizes_value() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(42);
        let ensured = gw
            .ensure_database_state("1", &session, None, None)
            .await
            .expect("ensure failed");

        let state = gw
            .persist_step_progress(ensured.step_state, "big", &json!(u64::MAX))
            .await
            .expect("persist failed")
            .expect("state");
        assert_eq!(state.answers.get("big"), Some(&json!(u64::MAX.to_string())));
    }

    #[tokio::test]
    async fn test_persist_step_progress_passthrough_without_state() {
        let gw = gateway(&MemoryDatabase::new());
        let result = gw
            .persist_step_progress(None, "p", &json!(1))
            .await
            .expect("persist failed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_sync_session_state_skips_when_equal() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let mut session = session_with_user(42);
        session.data.insert("k".to_string(), json!("v"));

        let ensured = gw
            .ensure_database_state("1", &session, None, None)
            .await
            .expect("ensure failed");
        let writes = db.mutation_count();

        gw.sync_session_state(ensured.step_state, &session.data)
            .await
            .expect("sync failed");
        assert_eq!(db.mutation_count(), writes);
    }

    #[tokio::test]
    async fn test_sync_session_state_writes_derived_slots() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(42);
        let ensured = gw
            .ensure_database_state("1", &session, None, None)
            .await
            .expect("ensure failed");

        let mut data = session.data.clone();
        data.insert("derived".to_string(), json!({"score": 7}));

        let state = gw
            .sync_session_state(ensured.step_state, &data)
            .await
            .expect("sync failed")
            .expect("state");
        assert_eq!(state.answers.get("derived"), Some(&json!({"score": 7})));
    }

    #[tokio::test]
    async fn test_update_current_page_noop_and_clear() {
        let db = MemoryDatabase::new();
        let gw = gateway(&db);

        let session = session_with_user(42);
        let ensured = gw
            .ensure_database_state("1", &session, None, Some("a"))
            .await
            .expect("ensure failed");
        let writes = db.mutation_count();

        // Same page: no write.
        let state = gw
            .update_current_page(ensured.step_state, Some("a"))
            .await
            .expect("update failed");
        assert_eq!(db.mutation_count(), writes);

        // Clear.
        let state = gw
            .update_current_page(state, None)
            .await
            .expect("update failed")
            .expect("state");
        assert!(state.current_page.is_none());
    }

    #[tokio::test]
    async fn test_noop_gateway_passes_through() {
        let gw = NoopGateway;
        let session = session_with_user(1);

        let ensured = gw
            .ensure_database_state("1", &session, None, Some("a"))
            .await
            .expect("ensure failed");
        assert!(ensured.user.is_none());
        assert!(ensured.step_state.is_none());

        assert!(
            gw.persist_step_progress(None, "p", &json!(1))
                .await
                .expect("persist failed")
                .is_none()
        );
        assert!(
            gw.sync_session_state(None, &Map::new())
                .await
                .expect("sync failed")
                .is_none()
        );
        assert!(
            gw.update_current_page(None, None)
                .await
                .expect("update failed")
                .is_none()
        );
    }
}
