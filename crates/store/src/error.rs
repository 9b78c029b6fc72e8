//! Error types for the store crate.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid {kind} value: '{value}'")]
    InvalidEnum { kind: &'static str, value: String },

    #[error("incident '{0}' not found")]
    IncidentNotFound(Uuid),

    #[error("remediation action '{0}' not found")]
    ActionNotFound(Uuid),

    #[error("conversation session '{0}' not found")]
    SessionNotFound(Uuid),

    #[error("service policy for '{0}' not found")]
    PolicyNotFound(String),

    #[error("invalid incident status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("incident '{incident_id}' already has a non-terminal action '{action_id}'")]
    ConcurrentActionInProgress {
        incident_id: Uuid,
        action_id: Uuid,
    },

    #[error("failed to encode column '{column}': {reason}")]
    Encode { column: &'static str, reason: String },

    #[error("failed to decode column '{column}': {reason}")]
    Decode { column: &'static str, reason: String },
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
