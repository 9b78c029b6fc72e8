//! Conversation session and message persistence.
//!
//! A session is uniquely identified by `(channel, channel_ref)`; opening
//! an existing thread returns the existing session.

use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::incidents::{decode_json, decode_timestamp, decode_uuid, encode_json};
use crate::types::{ConversationMessage, ConversationSession, MessageRole};
use crate::{Store, StoreError, StoreResult};

impl Store {
    /// Find the session for a chat thread, creating it if absent.
    pub async fn find_or_create_session(
        &self,
        channel: &str,
        channel_ref: &str,
        participant_id: &str,
        incident_id: Option<Uuid>,
    ) -> StoreResult<ConversationSession> {
        let mut tx = self.pool.begin().await?;

        let existing =
            sqlx::query("SELECT * FROM conversation_sessions WHERE channel = ? AND channel_ref = ?")
                .bind(channel)
                .bind(channel_ref)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(row) = existing {
            tx.commit().await?;
            return row_to_session(&row);
        }

        let session = ConversationSession {
            id: Uuid::new_v4(),
            incident_id,
            channel: channel.to_string(),
            channel_ref: channel_ref.to_string(),
            participant_id: participant_id.to_string(),
            started_at: Utc::now(),
            closed_at: None,
            context: Value::Object(serde_json::Map::new()),
        };

        sqlx::query(
            "INSERT INTO conversation_sessions (id, incident_id, channel, channel_ref, \
             participant_id, started_at, closed_at, context) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.incident_id.map(|i| i.to_string()))
        .bind(&session.channel)
        .bind(&session.channel_ref)
        .bind(&session.participant_id)
        .bind(session.started_at.to_rfc3339())
        .bind(Option::<String>::None)
        .bind(encode_json("context", &session.context)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session)
    }

    /// Fetch a session by id.
    pub async fn session(&self, id: Uuid) -> StoreResult<ConversationSession> {
        let row = sqlx::query("SELECT * FROM conversation_sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::SessionNotFound(id))?;
        row_to_session(&row)
    }

    /// Close a session. `closed_at` is set exactly once; closing an
    /// already-closed session is a no-op.
    pub async fn close_session(&self, id: Uuid) -> StoreResult<ConversationSession> {
        sqlx::query(
            "UPDATE conversation_sessions SET closed_at = ? WHERE id = ? AND closed_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        self.session(id).await
    }

    /// Close open sessions whose most recent message (or start, if empty)
    /// is older than `idle`. Returns the closed session ids.
    pub async fn close_idle_sessions(&self, idle: Duration) -> StoreResult<Vec<Uuid>> {
        let cutoff = (Utc::now() - idle).to_rfc3339();

        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT s.id FROM conversation_sessions s WHERE s.closed_at IS NULL \
             AND COALESCE((SELECT MAX(m.timestamp) FROM conversation_messages m \
                           WHERE m.session_id = s.id), s.started_at) < ?",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut closed = Vec::with_capacity(rows.len());
        for id in rows {
            let id = decode_uuid("id", &id)?;
            self.close_session(id).await?;
            closed.push(id);
        }
        Ok(closed)
    }

    /// Append a message to a session.
    pub async fn append_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
        action_ref: Option<Uuid>,
    ) -> StoreResult<ConversationMessage> {
        let message = ConversationMessage {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            action_ref,
        };

        sqlx::query(
            "INSERT INTO conversation_messages (id, session_id, role, content, timestamp, \
             action_ref) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp.to_rfc3339())
        .bind(message.action_ref.map(|a| a.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    /// Messages for a session in timestamp order.
    pub async fn messages(&self, session_id: Uuid) -> StoreResult<Vec<ConversationMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM conversation_messages WHERE session_id = ? ORDER BY timestamp, id",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }
}

fn row_to_session(row: &SqliteRow) -> StoreResult<ConversationSession> {
    let id: String = row.try_get("id")?;
    let incident_id: Option<String> = row.try_get("incident_id")?;
    let started_at: String = row.try_get("started_at")?;
    let closed_at: Option<String> = row.try_get("closed_at")?;
    let context: String = row.try_get("context")?;

    Ok(ConversationSession {
        id: decode_uuid("id", &id)?,
        incident_id: incident_id
            .map(|i| decode_uuid("incident_id", &i))
            .transpose()?,
        channel: row.try_get("channel")?,
        channel_ref: row.try_get("channel_ref")?,
        participant_id: row.try_get("participant_id")?,
        started_at: decode_timestamp("started_at", &started_at)?,
        closed_at: closed_at
            .map(|t| decode_timestamp("closed_at", &t))
            .transpose()?,
        context: decode_json("context", &context)?,
    })
}

fn row_to_message(row: &SqliteRow) -> StoreResult<ConversationMessage> {
    let id: String = row.try_get("id")?;
    let session_id: String = row.try_get("session_id")?;
    let role: String = row.try_get("role")?;
    let timestamp: String = row.try_get("timestamp")?;
    let action_ref: Option<String> = row.try_get("action_ref")?;

    Ok(ConversationMessage {
        id: decode_uuid("id", &id)?,
        session_id: decode_uuid("session_id", &session_id)?,
        role: MessageRole::parse(&role)?,
        content: row.try_get("content")?,
        timestamp: decode_timestamp("timestamp", &timestamp)?,
        action_ref: action_ref
            .map(|a| decode_uuid("action_ref", &a))
            .transpose()?,
    })
}
