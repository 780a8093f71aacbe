//! Centralized log and reply phrases.
//!
//! Every recognizable string the framework logs or sends lives here so
//! operators can swap the table (localization, tone) without touching the
//! runtime. Templates use `{placeholder}` substitution.

/// Overridable table of framework phrases.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTable {
    /// Logged once a runtime is constructed. `{bot_id}`
    pub runtime_initialized: String,
    /// Registration failed because no id could be derived.
    pub bot_id_resolution_failed: String,
    /// A handler declaration could not be used. `{event}`
    pub invalid_handler: String,
    /// A handler was declared without a listener. `{event}`
    pub handler_missing_listener: String,
    /// A page was registered without an id and skipped.
    pub page_without_id: String,
    /// The session points at a page that no longer exists. `{page_id}` `{chat_id}`
    pub page_not_found: String,
    /// A resolved successor does not exist. `{page_id}` `{chat_id}`
    pub next_page_not_found: String,
    /// The configured initial page is missing. `{page_id}`
    pub dangling_initial_page: String,
    /// No page is available to start the conversation. `{chat_id}`
    pub no_initial_page: String,
    /// The message-step failed and the update was dropped. `{chat_id}` `{error}`
    pub message_handling_error: String,
    /// A handler pipeline failed. `{event}` `{error}`
    pub middleware_error: String,
    /// Sent to the user when validation fails without its own text.
    pub validation_failed: String,
    /// Sent to the user when a page middleware denies without its own text.
    pub page_rejected: String,
}

impl Default for MessageTable {
    fn default() -> Self {
        Self {
            runtime_initialized: "Bot runtime '{bot_id}' initialized".to_string(),
            bot_id_resolution_failed:
                "Unable to resolve a bot id: provide id, slug, or token".to_string(),
            invalid_handler: "Ignoring invalid handler for event '{event}'".to_string(),
            handler_missing_listener:
                "Handler for event '{event}' has no listener; skipping".to_string(),
            page_without_id: "Ignoring page registered without an id".to_string(),
            page_not_found: "Page '{page_id}' not found for chat {chat_id}".to_string(),
            next_page_not_found: "Next page '{page_id}' not found for chat {chat_id}".to_string(),
            dangling_initial_page:
                "Configured initial page '{page_id}' is not registered".to_string(),
            no_initial_page: "No initial page available for chat {chat_id}".to_string(),
            message_handling_error:
                "Failed to handle message for chat {chat_id}: {error}".to_string(),
            middleware_error: "Handler pipeline for '{event}' failed: {error}".to_string(),
            validation_failed: "That doesn't look right. Please try again.".to_string(),
            page_rejected: "You can't open this page right now.".to_string(),
        }
    }
}

impl MessageTable {
    /// Substitute `{key}` placeholders in a template.
    pub fn format(template: &str, context: &[(&str, &str)]) -> String {
        let mut out = template.to_string();
        for (key, value) in context {
            out = out.replace(&format!("{{{}}}", key), value);
        }
        out
    }

    pub fn runtime_initialized(&self, bot_id: &str) -> String {
        Self::format(&self.runtime_initialized, &[("bot_id", bot_id)])
    }

    pub fn invalid_handler(&self, event: &str) -> String {
        Self::format(&self.invalid_handler, &[("event", event)])
    }

    pub fn handler_missing_listener(&self, event: &str) -> String {
        Self::format(&self.handler_missing_listener, &[("event", event)])
    }

    pub fn page_not_found(&self, page_id: &str, chat_id: &str) -> String {
        Self::format(
            &self.page_not_found,
            &[("page_id", page_id), ("chat_id", chat_id)],
        )
    }

    pub fn next_page_not_found(&self, page_id: &str, chat_id: &str) -> String {
        Self::format(
            &self.next_page_not_found,
            &[("page_id", page_id), ("chat_id", chat_id)],
        )
    }

    pub fn dangling_initial_page(&self, page_id: &str) -> String {
        Self::format(&self.dangling_initial_page, &[("page_id", page_id)])
    }

    pub fn no_initial_page(&self, chat_id: &str) -> String {
        Self::format(&self.no_initial_page, &[("chat_id", chat_id)])
    }

    pub fn message_handling_error(&self, chat_id: &str, error: &str) -> String {
        Self::format(
            &self.message_handling_error,
            &[("chat_id", chat_id), ("error", error)],
        )
    }

    pub fn middleware_error(&self, event: &str, error: &str) -> String {
        Self::format(
            &self.middleware_error,
            &[("event", event), ("error", error)],
        )
    }
}
