//! Remediation action persistence.
//!
//! Invariant: an incident has at most one action in `pending` or
//! `in_progress` at any instant. Creation checks the invariant inside the
//! same transaction as the insert.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::incidents::{decode_json, decode_timestamp, decode_uuid, encode_json};
use crate::types::{ActionStatus, InitiatorType, RecommendedAction, RemediationAction};
use crate::{Store, StoreError, StoreResult};

impl Store {
    /// Create a pending remediation action for an incident.
    ///
    /// Fails with [`StoreError::ConcurrentActionInProgress`] when another
    /// non-terminal action already exists for the incident.
    pub async fn create_action(
        &self,
        incident_id: Uuid,
        initiator_type: InitiatorType,
        initiator_ref: Option<&str>,
        action_type: RecommendedAction,
        parameters: Value,
    ) -> StoreResult<RemediationAction> {
        let mut tx = self.pool.begin().await?;

        let inflight: Option<String> = sqlx::query_scalar(
            "SELECT id FROM remediation_actions \
             WHERE incident_id = ? AND status IN ('pending', 'in_progress') LIMIT 1",
        )
        .bind(incident_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(existing) = inflight {
            return Err(StoreError::ConcurrentActionInProgress {
                incident_id,
                action_id: decode_uuid("id", &existing)?,
            });
        }

        let action = RemediationAction {
            id: Uuid::new_v4(),
            incident_id,
            initiator_type,
            initiator_ref: initiator_ref.map(str::to_string),
            action_type,
            parameters,
            requested_at: Utc::now(),
            completed_at: None,
            status: ActionStatus::Pending,
            result_message: None,
            failure_reason: None,
        };

        sqlx::query(
            "INSERT INTO remediation_actions (id, incident_id, initiator_type, initiator_ref, \
             action_type, parameters, requested_at, completed_at, status, result_message, \
             failure_reason) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(action.id.to_string())
        .bind(action.incident_id.to_string())
        .bind(action.initiator_type.as_str())
        .bind(&action.initiator_ref)
        .bind(action.action_type.as_str())
        .bind(encode_json("parameters", &action.parameters)?)
        .bind(action.requested_at.to_rfc3339())
        .bind(Option::<String>::None)
        .bind(action.status.as_str())
        .bind(Option::<String>::None)
        .bind(Option::<String>::None)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(action)
    }

    /// Fetch an action by id.
    pub async fn action(&self, id: Uuid) -> StoreResult<RemediationAction> {
        let row = sqlx::query("SELECT * FROM remediation_actions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::ActionNotFound(id))?;
        row_to_action(&row)
    }

    /// Mark an action in progress.
    pub async fn start_action(&self, id: Uuid) -> StoreResult<RemediationAction> {
        sqlx::query("UPDATE remediation_actions SET status = 'in_progress' WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        self.action(id).await
    }

    /// Complete an action successfully.
    pub async fn complete_action(
        &self,
        id: Uuid,
        result_message: &str,
    ) -> StoreResult<RemediationAction> {
        sqlx::query(
            "UPDATE remediation_actions SET status = 'succeeded', completed_at = ?, \
             result_message = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(result_message)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        self.action(id).await
    }

    /// Fail an action with a reason.
    pub async fn fail_action(
        &self,
        id: Uuid,
        failure_reason: &str,
    ) -> StoreResult<RemediationAction> {
        sqlx::query(
            "UPDATE remediation_actions SET status = 'failed', completed_at = ?, \
             failure_reason = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(failure_reason)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        self.action(id).await
    }

    /// All actions for an incident, oldest first.
    pub async fn actions_for_incident(
        &self,
        incident_id: Uuid,
    ) -> StoreResult<Vec<RemediationAction>> {
        let rows = sqlx::query(
            "SELECT * FROM remediation_actions WHERE incident_id = ? ORDER BY requested_at",
        )
        .bind(incident_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_action).collect()
    }

    /// Non-terminal actions requested before `now - age`.
    ///
    /// Startup recovery re-evaluates these against live platform state
    /// before issuing any fresh mutation.
    pub async fn stale_actions(&self, age: Duration) -> StoreResult<Vec<RemediationAction>> {
        let cutoff: DateTime<Utc> = Utc::now() - age;
        let rows = sqlx::query(
            "SELECT * FROM remediation_actions \
             WHERE status IN ('pending', 'in_progress') AND requested_at < ? \
             ORDER BY requested_at",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_action).collect()
    }
}

fn row_to_action(row: &SqliteRow) -> StoreResult<RemediationAction> {
    let id: String = row.try_get("id")?;
    let incident_id: String = row.try_get("incident_id")?;
    let initiator_type: String = row.try_get("initiator_type")?;
    let action_type: String = row.try_get("action_type")?;
    let status: String = row.try_get("status")?;
    let parameters: String = row.try_get("parameters")?;
    let requested_at: String = row.try_get("requested_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(RemediationAction {
        id: decode_uuid("id", &id)?,
        incident_id: decode_uuid("incident_id", &incident_id)?,
        initiator_type: InitiatorType::parse(&initiator_type)?,
        initiator_ref: row.try_get("initiator_ref")?,
        action_type: RecommendedAction::parse(&action_type)?,
        parameters: decode_json("parameters", &parameters)?,
        requested_at: decode_timestamp("requested_at", &requested_at)?,
        completed_at: completed_at
            .map(|t| decode_timestamp("completed_at", &t))
            .transpose()?,
        status: ActionStatus::parse(&status)?,
        result_message: row.try_get("result_message")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}
