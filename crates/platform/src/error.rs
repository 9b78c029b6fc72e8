//! Error types for the platform crate.

use thiserror::Error;

/// Errors from Railway API calls and log subscriptions.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Railway API token is not configured")]
    NotConfigured,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("Railway API error: {0}")]
    Api(String),

    #[error("rate limited by the Railway API")]
    RateLimited,

    #[error("unauthorized: the Railway API rejected the token")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no service instance matches environment '{environment_id}' for service '{service_id}'")]
    NoInstanceForEnvironment {
        service_id: String,
        environment_id: String,
    },

    #[error("service '{0}' has no deployment yet")]
    NoDeployment(String),

    #[error("no successful prior deployment to roll back to for service '{0}'")]
    NoRollbackTarget(String),

    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("subscription target '{0}' is quarantined; re-enable it explicitly")]
    Quarantined(String),
}

/// Result alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;
