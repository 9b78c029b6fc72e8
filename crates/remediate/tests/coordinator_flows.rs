//! Coordinator flows against in-memory state and an unconfigured
//! platform client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use broker::{topics, Broker};
use platform::RailwayClient;
use remediate::{recover_stale_actions, RemediationCoordinator};
use store::{
    ActionStatus, IncidentDraft, IncidentStatus, InitiatorType, PolicyCache, RecommendedAction,
    Severity, Store,
};

struct Harness {
    store: Store,
    broker: Arc<Broker>,
    coordinator: RemediationCoordinator,
    updates: mpsc::Receiver<serde_json::Value>,
}

async fn harness() -> Harness {
    let store = Store::open_in_memory().await.unwrap();
    let broker = Arc::new(Broker::new());
    let updates = broker.subscribe(topics::REMEDIATION_UPDATES);

    let coordinator = RemediationCoordinator::new(
        store.clone(),
        Arc::new(PolicyCache::new(store.clone())),
        Arc::new(RailwayClient::new(None, 50, 10_000)),
        Arc::clone(&broker),
        Some("p-1".to_string()),
    );

    Harness {
        store,
        broker,
        coordinator,
        updates,
    }
}

async fn seed_incident(store: &Store, confidence: f64) -> store::Incident {
    let draft = IncidentDraft {
        service_id: "svc-1".to_string(),
        service_name: "api".to_string(),
        environment_id: Some("env-1".to_string()),
        fingerprint: "fp-1".to_string(),
        severity: Severity::High,
        confidence,
        root_cause: Some("oom".to_string()),
        recommended_action: RecommendedAction::Restart,
        reasoning: None,
        log_context: json!({}),
        metadata: json!({}),
    };
    store
        .upsert_incident(&draft)
        .await
        .unwrap()
        .incident()
        .clone()
}

async fn next_update(updates: &mut mpsc::Receiver<serde_json::Value>) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("update published")
        .unwrap()
}

#[tokio::test]
async fn diagnostic_action_succeeds_without_rpc() {
    let mut h = harness().await;
    let incident = seed_incident(&h.store, 0.9).await;

    h.coordinator
        .handle_request(&json!({
            "event": "auto_fix_requested",
            "incident_id": incident.id.to_string(),
            "initiator": "user",
            "initiator_ref": "U1",
            "action_type": "none",
        }))
        .await;

    let started = next_update(&mut h.updates).await;
    assert_eq!(started["outcome"], "started");
    let done = next_update(&mut h.updates).await;
    assert_eq!(done["outcome"], "succeeded");
    assert_eq!(done["message"], "no action");

    let resolved = h.store.incident(incident.id).await.unwrap();
    assert_eq!(resolved.status, IncidentStatus::AutoRemediated);
    assert!(resolved.resolved_at.is_some());

    let actions = h.store.actions_for_incident(incident.id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].status, ActionStatus::Succeeded);
    assert_eq!(actions[0].initiator_type, InitiatorType::User);
}

#[tokio::test]
async fn unconfigured_platform_fails_the_action_cleanly() {
    let mut h = harness().await;
    let incident = seed_incident(&h.store, 0.9).await;

    h.coordinator
        .handle_request(&json!({
            "event": "auto_fix_requested",
            "incident_id": incident.id.to_string(),
            "initiator": "user",
            "action_type": "restart",
        }))
        .await;

    let started = next_update(&mut h.updates).await;
    assert_eq!(started["outcome"], "started");
    let failed = next_update(&mut h.updates).await;
    assert_eq!(failed["outcome"], "failed");
    assert!(failed["message"]
        .as_str()
        .unwrap()
        .contains("not configured"));

    let stored = h.store.incident(incident.id).await.unwrap();
    assert_eq!(stored.status, IncidentStatus::Failed);

    let actions = h.store.actions_for_incident(incident.id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].status, ActionStatus::Failed);
    assert!(actions[0].failure_reason.is_some());
}

#[tokio::test]
async fn terminal_incident_is_a_noop() {
    let mut h = harness().await;
    let incident = seed_incident(&h.store, 0.9).await;
    h.store
        .transition_incident(incident.id, IncidentStatus::Ignored)
        .await
        .unwrap();

    h.coordinator
        .handle_request(&json!({
            "event": "auto_fix_requested",
            "incident_id": incident.id.to_string(),
            "initiator": "user",
            "action_type": "restart",
        }))
        .await;

    let update = next_update(&mut h.updates).await;
    assert_eq!(update["outcome"], "skipped");
    assert_eq!(update["message"], "already resolved");

    assert!(h
        .store
        .actions_for_incident(incident.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn automated_initiator_is_gated_by_policy() {
    let mut h = harness().await;
    let incident = seed_incident(&h.store, 0.95).await;

    // Default policy has auto-remediation disabled.
    h.coordinator
        .handle_request(&json!({
            "event": "auto_fix_requested",
            "incident_id": incident.id.to_string(),
            "initiator": "automated",
            "action_type": "none",
        }))
        .await;

    let update = next_update(&mut h.updates).await;
    assert_eq!(update["outcome"], "skipped");
    assert!(update["message"].as_str().unwrap().contains("disabled"));
    assert!(h
        .store
        .actions_for_incident(incident.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn automated_initiator_needs_enough_confidence() {
    let mut h = harness().await;
    let incident = seed_incident(&h.store, 0.3).await;

    let mut policy = h.store.policy_or_default("svc-1", "api").await.unwrap();
    policy.auto_remediation_enabled = true;
    h.store.update_policy(&policy).await.unwrap();

    h.coordinator
        .handle_request(&json!({
            "event": "auto_fix_requested",
            "incident_id": incident.id.to_string(),
            "initiator": "automated",
            "action_type": "none",
        }))
        .await;

    let update = next_update(&mut h.updates).await;
    assert_eq!(update["outcome"], "skipped");
    assert!(update["message"].as_str().unwrap().contains("confidence"));
}

#[tokio::test]
async fn concurrent_action_is_refused() {
    let mut h = harness().await;
    let incident = seed_incident(&h.store, 0.9).await;

    h.store
        .create_action(
            incident.id,
            InitiatorType::User,
            None,
            RecommendedAction::Restart,
            json!({}),
        )
        .await
        .unwrap();

    h.coordinator
        .handle_request(&json!({
            "event": "auto_fix_requested",
            "incident_id": incident.id.to_string(),
            "initiator": "user",
            "action_type": "restart",
        }))
        .await;

    let update = next_update(&mut h.updates).await;
    assert_eq!(update["outcome"], "skipped");
    assert!(update["message"].as_str().unwrap().contains("in progress"));
}

#[tokio::test]
async fn scale_memory_requires_a_parameter() {
    let mut h = harness().await;
    let incident = seed_incident(&h.store, 0.9).await;

    h.coordinator
        .handle_request(&json!({
            "event": "auto_fix_requested",
            "incident_id": incident.id.to_string(),
            "initiator": "user",
            "action_type": "scale_memory",
            "parameters": {},
        }))
        .await;

    let started = next_update(&mut h.updates).await;
    assert_eq!(started["outcome"], "started");
    let failed = next_update(&mut h.updates).await;
    assert_eq!(failed["outcome"], "failed");
    assert!(failed["message"].as_str().unwrap().contains("memory_mb"));
}

#[tokio::test]
async fn stale_actions_are_recovered_at_startup() {
    let h = harness().await;
    let incident = seed_incident(&h.store, 0.9).await;

    let action = h
        .store
        .create_action(
            incident.id,
            InitiatorType::User,
            None,
            RecommendedAction::Restart,
            json!({}),
        )
        .await
        .unwrap();
    h.store.start_action(action.id).await.unwrap();
    h.store
        .transition_incident(incident.id, IncidentStatus::AwaitingAction)
        .await
        .unwrap();

    // Age the action past the stale threshold.
    let old = (chrono::Utc::now() - chrono::Duration::minutes(30)).to_rfc3339();
    sqlx::query("UPDATE remediation_actions SET requested_at = ?")
        .bind(&old)
        .execute(h.store.pool())
        .await
        .unwrap();

    let platform = Arc::new(RailwayClient::new(None, 50, 10_000));
    let recovered = recover_stale_actions(&h.store, &platform, &h.broker, Some("p-1"))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    // Unreachable platform means the action cannot be confirmed healthy.
    let actions = h.store.actions_for_incident(incident.id).await.unwrap();
    assert_eq!(actions[0].status, ActionStatus::Failed);
    let stored = h.store.incident(incident.id).await.unwrap();
    assert_eq!(stored.status, IncidentStatus::Failed);
}
