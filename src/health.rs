//! `GET /health`: liveness plus per-component readiness.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use platform::SubscriptionSupervisor;

/// Database probe deadline.
const DB_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared state for the health handler.
#[derive(Clone)]
pub struct HealthState {
    pub pool: SqlitePool,
    pub supervisor: Arc<SubscriptionSupervisor>,
    /// Whether the platform feature is enabled at all; without it the log
    /// stream is expected to be down.
    pub platform_enabled: bool,
}

/// Health handler: `{status, components: {app, database, log_stream}}`.
pub async fn health(State(state): State<HealthState>) -> Json<Value> {
    let database = probe_database(&state.pool).await;

    let log_stream = if !state.platform_enabled {
        "degraded"
    } else if state.supervisor.any_connected() {
        "ok"
    } else {
        "degraded"
    };

    let status = if database == "ok" && log_stream == "ok" {
        "ok"
    } else if database == "error" {
        "error"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "components": {
            "app": "ok",
            "database": database,
            "log_stream": log_stream,
        },
    }))
}

async fn probe_database(pool: &SqlitePool) -> &'static str {
    let probe = sqlx::query("SELECT 1").execute(pool);
    match tokio::time::timeout(DB_PROBE_TIMEOUT, probe).await {
        Ok(Ok(_)) => "ok",
        Ok(Err(_)) => "error",
        Err(_) => "degraded",
    }
}
