//! Embedded schema migrations.
//!
//! Statements are idempotent (`IF NOT EXISTS`) and run on every startup.

use sqlx::SqlitePool;

use crate::StoreResult;

const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS service_policies (
        service_id              TEXT PRIMARY KEY,
        service_name            TEXT NOT NULL,
        auto_remediation_enabled INTEGER NOT NULL DEFAULT 0,
        default_memory_mb       INTEGER,
        default_replicas        INTEGER,
        llm_provider            TEXT NOT NULL DEFAULT 'auto',
        confidence_threshold    REAL NOT NULL DEFAULT 0.8,
        updated_at              TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS incidents (
        id                  TEXT PRIMARY KEY,
        service_id          TEXT NOT NULL,
        service_name        TEXT NOT NULL,
        environment_id      TEXT,
        fingerprint         TEXT NOT NULL,
        severity            TEXT NOT NULL,
        status              TEXT NOT NULL,
        confidence          REAL NOT NULL,
        root_cause          TEXT,
        recommended_action  TEXT NOT NULL,
        reasoning           TEXT,
        log_context         TEXT NOT NULL DEFAULT '{}',
        detected_at         TEXT NOT NULL,
        resolved_at         TEXT,
        metadata            TEXT NOT NULL DEFAULT '{}',
        UNIQUE (service_id, fingerprint)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents (status)",
    "CREATE INDEX IF NOT EXISTS idx_incidents_detected_at ON incidents (detected_at)",
    r"
    CREATE TABLE IF NOT EXISTS remediation_actions (
        id              TEXT PRIMARY KEY,
        incident_id     TEXT NOT NULL REFERENCES incidents (id) ON DELETE CASCADE,
        initiator_type  TEXT NOT NULL,
        initiator_ref   TEXT,
        action_type     TEXT NOT NULL,
        parameters      TEXT NOT NULL DEFAULT '{}',
        requested_at    TEXT NOT NULL,
        completed_at    TEXT,
        status          TEXT NOT NULL,
        result_message  TEXT,
        failure_reason  TEXT
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_actions_incident ON remediation_actions (incident_id, requested_at)",
    "CREATE INDEX IF NOT EXISTS idx_actions_status ON remediation_actions (status)",
    r"
    CREATE TABLE IF NOT EXISTS conversation_sessions (
        id              TEXT PRIMARY KEY,
        incident_id     TEXT REFERENCES incidents (id) ON DELETE SET NULL,
        channel         TEXT NOT NULL,
        channel_ref     TEXT NOT NULL,
        participant_id  TEXT NOT NULL,
        started_at      TEXT NOT NULL,
        closed_at       TEXT,
        context         TEXT NOT NULL DEFAULT '{}',
        UNIQUE (channel, channel_ref)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS conversation_messages (
        id          TEXT PRIMARY KEY,
        session_id  TEXT NOT NULL REFERENCES conversation_sessions (id) ON DELETE CASCADE,
        role        TEXT NOT NULL,
        content     TEXT NOT NULL,
        timestamp   TEXT NOT NULL,
        action_ref  TEXT
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_messages_session ON conversation_messages (session_id, timestamp)",
];

/// Apply all migrations against the pool.
pub async fn run(pool: &SqlitePool) -> StoreResult<()> {
    // Cascades depend on foreign key enforcement being on.
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
