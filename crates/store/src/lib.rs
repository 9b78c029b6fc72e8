//! Durable state for railguard.
//!
//! A single [`Store`] owns the SQLite pool and exposes coarse APIs per
//! entity family:
//!
//! - service policies ([`policies`]) with a read-mostly cache
//! - incidents ([`incidents`]) with the deduplicating upsert and the
//!   status machine
//! - remediation actions ([`actions`]) with the at-most-one-in-flight
//!   invariant
//! - conversation sessions and messages ([`sessions`])
//! - the retention sweep ([`retention`])
//!
//! All timestamps are stored as RFC 3339 text in UTC; uuids as text.

pub mod actions;
pub mod error;
pub mod incidents;
pub mod migrations;
pub mod policies;
pub mod retention;
pub mod sessions;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use policies::PolicyCache;
pub use retention::{RetentionWorker, SweepReport};
pub use types::{
    ActionStatus, ConversationMessage, ConversationSession, Incident, IncidentDraft,
    IncidentStatus, InitiatorType, LlmProviderPref, MessageRole, RecommendedAction,
    RemediationAction, Severity, ServicePolicy, UpsertOutcome,
};

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Handle to the railguard database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and run
    /// migrations.
    pub async fn open(path: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path, "Database opened");
        Ok(store)
    }

    /// Open an in-memory database for tests.
    ///
    /// A single connection is required: every SQLite `:memory:` connection
    /// is its own database.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool (shared with the health probe).
    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        migrations::run(&self.pool).await
    }

    /// The underlying pool, for health probes.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
