//! Slack-facing layer: incident alerts with interactive controls, the
//! webhook endpoints that receive those interactions, and per-thread
//! conversation sessions.

pub mod alerts;
pub mod blocks;
pub mod conversation;
pub mod intent;
pub mod notifier;
pub mod signature;
pub mod webhook;

pub use alerts::AlertListener;
pub use conversation::{ConversationManager, IDLE_TIMEOUT_MINUTES};
pub use intent::{parse_intent, Intent};
pub use notifier::SlackNotifier;
pub use webhook::{webhook_router, ChatDeps, WebhookState};

use thiserror::Error;

/// Errors from the chat layer.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Slack is not configured (bot token / channel missing)")]
    NotConfigured,

    #[error("Slack API error: {0}")]
    Slack(String),

    #[error("rate limited by Slack (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error("malformed interaction payload: {0}")]
    MalformedPayload(String),
}

/// Result alias for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;
