//! Cross-module store flows against an in-memory database.

use serde_json::json;
use store::{
    IncidentDraft, IncidentStatus, InitiatorType, MessageRole, RecommendedAction, Severity, Store,
    StoreError, UpsertOutcome,
};

fn draft(service_id: &str, fingerprint: &str) -> IncidentDraft {
    IncidentDraft {
        service_id: service_id.to_string(),
        service_name: "api".to_string(),
        environment_id: Some("env-1".to_string()),
        fingerprint: fingerprint.to_string(),
        severity: Severity::High,
        confidence: 0.9,
        root_cause: Some("out of memory".to_string()),
        recommended_action: RecommendedAction::Restart,
        reasoning: Some("pattern match".to_string()),
        log_context: json!({"lines": ["FATAL: oom"]}),
        metadata: json!({}),
    }
}

#[tokio::test]
async fn upsert_is_deduplicating_and_preserves_detected_at() {
    let store = Store::open_in_memory().await.unwrap();

    let first = store.upsert_incident(&draft("svc-1", "fp-1")).await.unwrap();
    let UpsertOutcome::Created(created) = &first else {
        panic!("expected Created, got {first:?}");
    };

    // Same key again, twice.
    let second = store.upsert_incident(&draft("svc-1", "fp-1")).await.unwrap();
    let third = store.upsert_incident(&draft("svc-1", "fp-1")).await.unwrap();
    assert!(matches!(second, UpsertOutcome::Updated(_)));
    assert!(matches!(third, UpsertOutcome::Updated(_)));

    let stored = store.incident(created.id).await.unwrap();
    assert_eq!(stored.detected_at, created.detected_at);
    assert_eq!(store.open_incidents().await.unwrap().len(), 1);
}

#[tokio::test]
async fn upsert_skips_terminal_incidents() {
    let store = Store::open_in_memory().await.unwrap();

    let created = store
        .upsert_incident(&draft("svc-1", "fp-1"))
        .await
        .unwrap()
        .incident()
        .clone();
    store
        .transition_incident(created.id, IncidentStatus::Ignored)
        .await
        .unwrap();

    let outcome = store.upsert_incident(&draft("svc-1", "fp-1")).await.unwrap();
    assert!(outcome.is_skipped());

    let stored = store.incident(created.id).await.unwrap();
    assert_eq!(stored.status, IncidentStatus::Ignored);
    assert!(stored.resolved_at.is_some());
}

#[tokio::test]
async fn failed_incident_reopens_on_new_signal() {
    let store = Store::open_in_memory().await.unwrap();

    let created = store
        .upsert_incident(&draft("svc-1", "fp-1"))
        .await
        .unwrap()
        .incident()
        .clone();
    store
        .transition_incident(created.id, IncidentStatus::AwaitingAction)
        .await
        .unwrap();
    store
        .transition_incident(created.id, IncidentStatus::Failed)
        .await
        .unwrap();

    let outcome = store.upsert_incident(&draft("svc-1", "fp-1")).await.unwrap();
    let UpsertOutcome::Updated(updated) = outcome else {
        panic!("expected Updated");
    };
    assert_eq!(updated.status, IncidentStatus::Detected);
}

#[tokio::test]
async fn invalid_transition_is_rejected() {
    let store = Store::open_in_memory().await.unwrap();

    let created = store
        .upsert_incident(&draft("svc-1", "fp-1"))
        .await
        .unwrap()
        .incident()
        .clone();

    let err = store
        .transition_incident(created.id, IncidentStatus::AutoRemediated)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn at_most_one_action_in_flight() {
    let store = Store::open_in_memory().await.unwrap();

    let incident = store
        .upsert_incident(&draft("svc-1", "fp-1"))
        .await
        .unwrap()
        .incident()
        .clone();

    let action = store
        .create_action(
            incident.id,
            InitiatorType::User,
            Some("U123"),
            RecommendedAction::Restart,
            json!({}),
        )
        .await
        .unwrap();

    let err = store
        .create_action(
            incident.id,
            InitiatorType::Automated,
            None,
            RecommendedAction::Restart,
            json!({}),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::ConcurrentActionInProgress { .. }
    ));

    // Completing the first frees the slot.
    store.start_action(action.id).await.unwrap();
    store.complete_action(action.id, "restarted").await.unwrap();
    store
        .create_action(
            incident.id,
            InitiatorType::User,
            Some("U123"),
            RecommendedAction::Rollback,
            json!({}),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn session_reuse_and_single_close() {
    let store = Store::open_in_memory().await.unwrap();

    let first = store
        .find_or_create_session("chat", "C1:170.5", "U1", None)
        .await
        .unwrap();
    let second = store
        .find_or_create_session("chat", "C1:170.5", "U2", None)
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    store
        .append_message(first.id, MessageRole::System, "Chat session started", None)
        .await
        .unwrap();
    store
        .append_message(first.id, MessageRole::User, "status", None)
        .await
        .unwrap();

    let messages = store.messages(first.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));

    let closed = store.close_session(first.id).await.unwrap();
    let closed_at = closed.closed_at.expect("closed_at set");
    assert!(closed_at >= closed.started_at);

    // Second close keeps the original timestamp.
    let again = store.close_session(first.id).await.unwrap();
    assert_eq!(again.closed_at, Some(closed_at));
}

#[tokio::test]
async fn message_cascade_on_session_delete() {
    let store = Store::open_in_memory().await.unwrap();

    let session = store
        .find_or_create_session("chat", "C1:1.0", "U1", None)
        .await
        .unwrap();
    store
        .append_message(session.id, MessageRole::User, "hello", None)
        .await
        .unwrap();

    sqlx::query("DELETE FROM conversation_sessions WHERE id = ?")
        .bind(session.id.to_string())
        .execute(store.pool())
        .await
        .unwrap();

    let orphans: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM conversation_messages WHERE session_id = ?")
            .bind(session.id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(orphans, 0);
}

#[tokio::test]
async fn policy_provisioned_once_with_defaults() {
    let store = Store::open_in_memory().await.unwrap();

    let policy = store.policy_or_default("svc-1", "api").await.unwrap();
    assert!(!policy.auto_remediation_enabled);

    let mut updated = policy.clone();
    updated.auto_remediation_enabled = true;
    updated.confidence_threshold = 0.6;
    store.update_policy(&updated).await.unwrap();

    // A later default fetch returns the stored row, not fresh defaults.
    let fetched = store.policy_or_default("svc-1", "api").await.unwrap();
    assert!(fetched.auto_remediation_enabled);
    assert!((fetched.confidence_threshold - 0.6).abs() < f64::EPSILON);
}

#[tokio::test]
async fn retention_sweep_deletes_old_rows() {
    let store = Store::open_in_memory().await.unwrap();

    let incident = store
        .upsert_incident(&draft("svc-1", "fp-1"))
        .await
        .unwrap()
        .incident()
        .clone();
    store
        .create_action(
            incident.id,
            InitiatorType::User,
            None,
            RecommendedAction::Restart,
            json!({}),
        )
        .await
        .unwrap();

    // Age the rows past the horizon.
    let old = (chrono::Utc::now() - chrono::Duration::days(120)).to_rfc3339();
    sqlx::query("UPDATE incidents SET detected_at = ?")
        .bind(&old)
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE remediation_actions SET requested_at = ?")
        .bind(&old)
        .execute(store.pool())
        .await
        .unwrap();

    let worker = store::RetentionWorker::new(store.clone(), 90);
    let report = worker.sweep().await.unwrap();
    assert_eq!(report.incidents, 1);
    assert_eq!(report.actions, 1);

    assert!(store.incident(incident.id).await.is_err());
}
