//! Daily retention sweep.
//!
//! Deletes incidents, remediation actions, and conversation sessions whose
//! anchor timestamp is older than the retention horizon. Actions and
//! messages go with their parents via FK cascade. Failures are logged and
//! swallowed; the next tick retries.

use chrono::{Duration, Utc};
use rand::Rng;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{Store, StoreResult};

/// Sweep interval.
const SWEEP_INTERVAL_HOURS: i64 = 24;

/// Maximum startup/interval jitter.
const JITTER_SECS: u64 = 900;

/// Counts deleted by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub incidents: u64,
    pub actions: u64,
    pub sessions: u64,
}

/// Periodic retention worker.
pub struct RetentionWorker {
    store: Store,
    retention_days: i64,
}

impl RetentionWorker {
    #[must_use]
    pub fn new(store: Store, retention_days: i64) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let jitter = rand::thread_rng().gen_range(0..JITTER_SECS);
            let sleep = std::time::Duration::from_secs(
                (SWEEP_INTERVAL_HOURS * 3600) as u64 + jitter,
            );

            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }

            match self.sweep().await {
                Ok(report) => {
                    info!(
                        incidents = report.incidents,
                        actions = report.actions,
                        sessions = report.sessions,
                        retention_days = self.retention_days,
                        "Retention sweep complete"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Retention sweep failed, will retry next tick");
                }
            }
        }
    }

    /// Delete everything older than the horizon. Exposed for tests and the
    /// admin path.
    pub async fn sweep(&self) -> StoreResult<SweepReport> {
        let cutoff = (Utc::now() - Duration::days(self.retention_days)).to_rfc3339();
        let pool = self.store.pool();

        // Orphaned actions first: their own anchor can age out before the
        // parent incident does.
        let actions = sqlx::query("DELETE FROM remediation_actions WHERE requested_at < ?")
            .bind(&cutoff)
            .execute(pool)
            .await?
            .rows_affected();

        let incidents = sqlx::query("DELETE FROM incidents WHERE detected_at < ?")
            .bind(&cutoff)
            .execute(pool)
            .await?
            .rows_affected();

        let sessions = sqlx::query("DELETE FROM conversation_sessions WHERE started_at < ?")
            .bind(&cutoff)
            .execute(pool)
            .await?
            .rows_affected();

        Ok(SweepReport {
            incidents,
            actions,
            sessions,
        })
    }
}
