//! Incident persistence: deduplicating upsert and the status machine.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{
    Incident, IncidentDraft, IncidentStatus, RecommendedAction, Severity, UpsertOutcome,
};
use crate::{Store, StoreError, StoreResult};

impl Store {
    /// Upsert an incident candidate keyed by `(service_id, fingerprint)`.
    ///
    /// - no existing row: insert with status `detected`
    /// - existing row in `detected | awaiting_action | failed`: refresh the
    ///   mutable fields; `failed` flips back to `detected` on a new signal
    /// - existing row in a terminal state: skipped, nothing written
    ///
    /// Two detectors racing to create the same incident are resolved by the
    /// unique index: the loser re-reads and takes the update path.
    pub async fn upsert_incident(&self, draft: &IncidentDraft) -> StoreResult<UpsertOutcome> {
        for attempt in 0..2 {
            match self.try_upsert_incident(draft).await {
                Err(StoreError::Database(sqlx::Error::Database(db)))
                    if db.is_unique_violation() && attempt == 0 =>
                {
                    debug!(
                        service_id = %draft.service_id,
                        fingerprint = %draft.fingerprint,
                        "Upsert lost insert race, retrying as update"
                    );
                }
                other => return other,
            }
        }
        unreachable!("second upsert attempt cannot race an insert")
    }

    async fn try_upsert_incident(&self, draft: &IncidentDraft) -> StoreResult<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT * FROM incidents WHERE service_id = ? AND fingerprint = ?",
        )
        .bind(&draft.service_id)
        .bind(&draft.fingerprint)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                let incident = Incident {
                    id: Uuid::new_v4(),
                    service_id: draft.service_id.clone(),
                    service_name: draft.service_name.clone(),
                    environment_id: draft.environment_id.clone(),
                    fingerprint: draft.fingerprint.clone(),
                    severity: draft.severity,
                    status: IncidentStatus::Detected,
                    confidence: draft.confidence,
                    root_cause: draft.root_cause.clone(),
                    recommended_action: draft.recommended_action,
                    reasoning: draft.reasoning.clone(),
                    log_context: draft.log_context.clone(),
                    detected_at: Utc::now(),
                    resolved_at: None,
                    metadata: draft.metadata.clone(),
                };

                sqlx::query(
                    "INSERT INTO incidents (id, service_id, service_name, environment_id, \
                     fingerprint, severity, status, confidence, root_cause, recommended_action, \
                     reasoning, log_context, detected_at, resolved_at, metadata) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(incident.id.to_string())
                .bind(&incident.service_id)
                .bind(&incident.service_name)
                .bind(&incident.environment_id)
                .bind(&incident.fingerprint)
                .bind(incident.severity.as_str())
                .bind(incident.status.as_str())
                .bind(incident.confidence)
                .bind(&incident.root_cause)
                .bind(incident.recommended_action.as_str())
                .bind(&incident.reasoning)
                .bind(encode_json("log_context", &incident.log_context)?)
                .bind(incident.detected_at.to_rfc3339())
                .bind(Option::<String>::None)
                .bind(encode_json("metadata", &incident.metadata)?)
                .execute(&mut *tx)
                .await?;

                UpsertOutcome::Created(incident)
            }
            Some(row) => {
                let mut incident = row_to_incident(&row)?;

                if incident.status.is_terminal() {
                    tx.commit().await?;
                    return Ok(UpsertOutcome::Skipped(incident));
                }

                // A fresh signal reopens a failed incident.
                if incident.status == IncidentStatus::Failed {
                    incident.status = IncidentStatus::Detected;
                }
                incident.severity = draft.severity;
                incident.confidence = draft.confidence;
                incident.root_cause = draft.root_cause.clone();
                incident.recommended_action = draft.recommended_action;
                incident.reasoning = draft.reasoning.clone();
                incident.log_context = draft.log_context.clone();
                incident.metadata = draft.metadata.clone();

                sqlx::query(
                    "UPDATE incidents SET severity = ?, status = ?, confidence = ?, \
                     root_cause = ?, recommended_action = ?, reasoning = ?, log_context = ?, \
                     metadata = ? WHERE id = ?",
                )
                .bind(incident.severity.as_str())
                .bind(incident.status.as_str())
                .bind(incident.confidence)
                .bind(&incident.root_cause)
                .bind(incident.recommended_action.as_str())
                .bind(&incident.reasoning)
                .bind(encode_json("log_context", &incident.log_context)?)
                .bind(encode_json("metadata", &incident.metadata)?)
                .bind(incident.id.to_string())
                .execute(&mut *tx)
                .await?;

                UpsertOutcome::Updated(incident)
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Fetch an incident by id.
    pub async fn incident(&self, id: Uuid) -> StoreResult<Incident> {
        let row = sqlx::query("SELECT * FROM incidents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::IncidentNotFound(id))?;
        row_to_incident(&row)
    }

    /// Transition an incident's status, enforcing the allowed edge set.
    ///
    /// Entering a terminal state stamps `resolved_at` (once). Returns the
    /// updated incident.
    pub async fn transition_incident(
        &self,
        id: Uuid,
        to: IncidentStatus,
    ) -> StoreResult<Incident> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM incidents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::IncidentNotFound(id))?;
        let mut incident = row_to_incident(&row)?;

        if !incident.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: incident.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        incident.status = to;
        if to.is_terminal() && incident.resolved_at.is_none() {
            incident.resolved_at = Some(Utc::now());
        }

        sqlx::query("UPDATE incidents SET status = ?, resolved_at = ? WHERE id = ?")
            .bind(incident.status.as_str())
            .bind(incident.resolved_at.map(|t| t.to_rfc3339()))
            .bind(incident.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(incident)
    }

    /// Merge a key into the incident's metadata map.
    ///
    /// Used by the notifier to record the alert's Slack thread.
    pub async fn merge_incident_metadata(
        &self,
        id: Uuid,
        key: &str,
        value: Value,
    ) -> StoreResult<Incident> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM incidents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::IncidentNotFound(id))?;
        let mut incident = row_to_incident(&row)?;

        if !incident.metadata.is_object() {
            incident.metadata = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = incident.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }

        sqlx::query("UPDATE incidents SET metadata = ? WHERE id = ?")
            .bind(encode_json("metadata", &incident.metadata)?)
            .bind(incident.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(incident)
    }

    /// All incidents currently in a non-terminal status, newest first.
    pub async fn open_incidents(&self) -> StoreResult<Vec<Incident>> {
        let rows = sqlx::query(
            "SELECT * FROM incidents \
             WHERE status IN ('detected', 'awaiting_action', 'failed') \
             ORDER BY detected_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_incident).collect()
    }

    /// Incidents in a given status, newest first.
    pub async fn incidents_by_status(
        &self,
        status: IncidentStatus,
    ) -> StoreResult<Vec<Incident>> {
        let rows =
            sqlx::query("SELECT * FROM incidents WHERE status = ? ORDER BY detected_at DESC")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_incident).collect()
    }

    /// The most recent incidents regardless of status.
    pub async fn recent_incidents(&self, limit: i64) -> StoreResult<Vec<Incident>> {
        let rows = sqlx::query("SELECT * FROM incidents ORDER BY detected_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_incident).collect()
    }
}

pub(crate) fn encode_json(column: &'static str, value: &Value) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Encode {
        column,
        reason: e.to_string(),
    })
}

pub(crate) fn decode_json(column: &'static str, raw: &str) -> StoreResult<Value> {
    serde_json::from_str(raw).map_err(|e| StoreError::Decode {
        column,
        reason: e.to_string(),
    })
}

pub(crate) fn decode_uuid(column: &'static str, raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Decode {
        column,
        reason: e.to_string(),
    })
}

pub(crate) fn decode_timestamp(column: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode {
            column,
            reason: e.to_string(),
        })
}

pub(crate) fn row_to_incident(row: &SqliteRow) -> StoreResult<Incident> {
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;
    let action: String = row.try_get("recommended_action")?;
    let id: String = row.try_get("id")?;
    let log_context: String = row.try_get("log_context")?;
    let metadata: String = row.try_get("metadata")?;
    let detected_at: String = row.try_get("detected_at")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;

    let severity = Severity::parse(&severity).inspect_err(|_| {
        warn!(id = %id, value = %severity, "Corrupt severity tag in incidents row");
    })?;

    Ok(Incident {
        id: decode_uuid("id", &id)?,
        service_id: row.try_get("service_id")?,
        service_name: row.try_get("service_name")?,
        environment_id: row.try_get("environment_id")?,
        fingerprint: row.try_get("fingerprint")?,
        severity,
        status: IncidentStatus::parse(&status)?,
        confidence: row.try_get("confidence")?,
        root_cause: row.try_get("root_cause")?,
        recommended_action: RecommendedAction::parse(&action)?,
        reasoning: row.try_get("reasoning")?,
        log_context: decode_json("log_context", &log_context)?,
        detected_at: decode_timestamp("detected_at", &detected_at)?,
        resolved_at: resolved_at
            .map(|t| decode_timestamp("resolved_at", &t))
            .transpose()?,
        metadata: decode_json("metadata", &metadata)?,
    })
}
