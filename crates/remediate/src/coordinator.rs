//! The remediation coordinator task.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use broker::{topics, Broker};
use platform::{PlatformError, RailwayClient};
use store::{
    Incident, IncidentStatus, InitiatorType, PolicyCache, RecommendedAction, RemediationAction,
    Store, StoreError,
};

/// Drives `auto_fix_requested` intents end to end.
pub struct RemediationCoordinator {
    store: Store,
    policies: Arc<PolicyCache>,
    platform: Arc<RailwayClient>,
    broker: Arc<Broker>,
    /// Project scope for deployment listings (rollback derivation).
    project_id: Option<String>,
}

impl RemediationCoordinator {
    #[must_use]
    pub fn new(
        store: Store,
        policies: Arc<PolicyCache>,
        platform: Arc<RailwayClient>,
        broker: Arc<Broker>,
        project_id: Option<String>,
    ) -> Self {
        Self {
            store,
            policies,
            platform,
            broker,
            project_id,
        }
    }

    /// Consume remediation intents until shutdown. In-flight work finishes
    /// before the task exits; no new intents are accepted after the signal.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut intents = self.broker.subscribe(topics::REMEDIATION_ACTIONS);
        info!("Remediation coordinator starting");

        loop {
            tokio::select! {
                intent = intents.recv() => {
                    let Some(intent) = intent else { return };
                    if intent.get("event").and_then(Value::as_str) != Some("auto_fix_requested") {
                        continue;
                    }
                    self.handle_request(&intent).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Remediation coordinator stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Process one `auto_fix_requested` intent. All failure paths are
    /// reported over `remediation:updates`, never panicked.
    pub async fn handle_request(&self, intent: &Value) {
        let Some(incident_id) = intent
            .get("incident_id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
        else {
            warn!("auto_fix_requested without a parseable incident_id");
            return;
        };

        let initiator = match intent.get("initiator").and_then(Value::as_str) {
            Some("automated") => InitiatorType::Automated,
            _ => InitiatorType::User,
        };
        let initiator_ref = intent
            .get("initiator_ref")
            .and_then(Value::as_str)
            .map(str::to_string);
        let parameters = intent.get("parameters").cloned().unwrap_or(json!({}));

        // 1. Load the incident; terminal incidents are a polite no-op.
        let incident = match self.store.incident(incident_id).await {
            Ok(incident) => incident,
            Err(e) => {
                warn!(incident_id = %incident_id, error = %e, "Unknown incident in intent");
                return;
            }
        };
        if incident.status.is_terminal() {
            debug!(incident_id = %incident_id, "Incident already resolved; skipping");
            self.publish_update(incident_id, "skipped", "already resolved");
            return;
        }

        let action_type = intent
            .get("action_type")
            .and_then(Value::as_str)
            .and_then(|raw| RecommendedAction::parse(raw).ok())
            .unwrap_or(incident.recommended_action);

        // 2. Policy gate, for automated initiators only.
        if initiator == InitiatorType::Automated {
            let policy = match self
                .policies
                .get(&incident.service_id, &incident.service_name)
                .await
            {
                Ok(policy) => policy,
                Err(e) => {
                    warn!(error = %e, "Policy lookup failed; refusing automated action");
                    self.publish_update(incident_id, "skipped", "policy unavailable");
                    return;
                }
            };
            if !policy.auto_remediation_enabled {
                info!(
                    service_id = %incident.service_id,
                    "Auto-remediation disabled by policy"
                );
                self.publish_update(incident_id, "skipped", "auto-remediation disabled by policy");
                return;
            }
            if incident.confidence < policy.confidence_threshold {
                info!(
                    service_id = %incident.service_id,
                    confidence = incident.confidence,
                    threshold = policy.confidence_threshold,
                    "Confidence below policy threshold"
                );
                self.publish_update(incident_id, "skipped", "confidence below policy threshold");
                return;
            }
        }

        // 3. Create the action; the store enforces at-most-one in flight.
        let action = match self
            .store
            .create_action(
                incident_id,
                initiator,
                initiator_ref.as_deref(),
                action_type,
                parameters.clone(),
            )
            .await
        {
            Ok(action) => action,
            Err(StoreError::ConcurrentActionInProgress { action_id, .. }) => {
                info!(
                    incident_id = %incident_id,
                    existing = %action_id,
                    "Another remediation is already in flight"
                );
                self.publish_update(
                    incident_id,
                    "skipped",
                    "another remediation is already in progress",
                );
                return;
            }
            Err(e) => {
                warn!(incident_id = %incident_id, error = %e, "Action creation failed");
                return;
            }
        };

        // 4. Move to in_progress and mark the incident awaiting.
        let action = match self.store.start_action(action.id).await {
            Ok(action) => action,
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "Could not start action");
                return;
            }
        };
        // A retried failure re-enters through `detected` first.
        if incident.status == IncidentStatus::Failed {
            if let Err(e) = self
                .store
                .transition_incident(incident_id, IncidentStatus::Detected)
                .await
            {
                warn!(incident_id = %incident_id, error = %e, "Reopen transition failed");
            }
        }
        if incident.status != IncidentStatus::AwaitingAction {
            if let Err(e) = self
                .store
                .transition_incident(incident_id, IncidentStatus::AwaitingAction)
                .await
            {
                warn!(incident_id = %incident_id, error = %e, "Awaiting transition failed");
            }
        }
        self.publish_update(
            incident_id,
            "started",
            &format!("`{}` on {}", action_type.as_str(), incident.service_name),
        );

        // 5. Dispatch the platform mutation.
        let outcome = self.dispatch(&incident, &action, &parameters).await;

        // 6. Bookkeeping and notification.
        match outcome {
            Ok(result_message) => {
                if let Err(e) = self.store.complete_action(action.id, &result_message).await {
                    warn!(action_id = %action.id, error = %e, "Completion write failed");
                }
                match self
                    .store
                    .transition_incident(incident_id, IncidentStatus::AutoRemediated)
                    .await
                {
                    Ok(resolved) => {
                        let latency_ms = resolved
                            .resolved_at
                            .map(|t| (t - resolved.detected_at).num_milliseconds())
                            .unwrap_or_default();
                        self.broker.publish(
                            topics::TELEMETRY_EVENTS,
                            json!({
                                "event": "remediation_completed",
                                "outcome": "succeeded",
                                "service_id": resolved.service_id,
                                "remediation_latency_ms": latency_ms,
                            }),
                        );
                    }
                    Err(e) => {
                        warn!(incident_id = %incident_id, error = %e, "Resolve transition failed");
                    }
                }
                info!(
                    incident_id = %incident_id,
                    action_id = %action.id,
                    action = action_type.as_str(),
                    "Remediation succeeded"
                );
                self.publish_update(incident_id, "succeeded", &result_message);
            }
            Err(reason) => {
                if let Err(e) = self.store.fail_action(action.id, &reason).await {
                    warn!(action_id = %action.id, error = %e, "Failure write failed");
                }
                if let Err(e) = self
                    .store
                    .transition_incident(incident_id, IncidentStatus::Failed)
                    .await
                {
                    warn!(incident_id = %incident_id, error = %e, "Failed transition failed");
                }
                self.broker.publish(
                    topics::TELEMETRY_EVENTS,
                    json!({
                        "event": "remediation_completed",
                        "outcome": "failed",
                        "service_id": incident.service_id,
                    }),
                );
                warn!(
                    incident_id = %incident_id,
                    action_id = %action.id,
                    reason = %reason,
                    "Remediation failed"
                );
                self.publish_update(incident_id, "failed", &reason);
            }
        }
    }

    /// Execute the platform RPC for an action. Returns a human-readable
    /// result message or a failure reason.
    async fn dispatch(
        &self,
        incident: &Incident,
        action: &RemediationAction,
        parameters: &Value,
    ) -> Result<String, String> {
        // The action id doubles as the mutation correlation id.
        let correlation_id = action.id;

        match action.action_type {
            RecommendedAction::Diagnostic | RecommendedAction::None | RecommendedAction::ManualFix => {
                return Ok("no action".to_string());
            }
            _ => {}
        }

        let environment_id = incident
            .environment_id
            .as_deref()
            .ok_or_else(|| "incident has no environment recorded".to_string())?;
        let service_id = &incident.service_id;
        let project_id = self.project_id.as_deref().unwrap_or_default();

        let result = match action.action_type {
            RecommendedAction::Restart => {
                match self
                    .platform
                    .latest_deployment_id(project_id, environment_id, service_id)
                    .await
                {
                    Ok(deployment_id) => self
                        .platform
                        .restart_deployment(&deployment_id, correlation_id)
                        .await
                        .map(|()| format!("restarted deployment {deployment_id}")),
                    // No deployment to restart in place; bounce the service.
                    Err(PlatformError::NoDeployment(_)) => self
                        .platform
                        .restart_service(service_id, environment_id, correlation_id)
                        .await
                        .map(|()| format!("restarted service {service_id}")),
                    Err(e) => Err(e),
                }
            }
            RecommendedAction::Redeploy => {
                let deployment_id = self
                    .platform
                    .latest_deployment_id(project_id, environment_id, service_id)
                    .await
                    .map_err(|e| e.to_string())?;
                self.platform
                    .redeploy_deployment(&deployment_id, correlation_id)
                    .await
                    .map(|()| format!("redeployed {deployment_id}"))
            }
            RecommendedAction::Stop => {
                let deployment_id = self
                    .platform
                    .latest_deployment_id(project_id, environment_id, service_id)
                    .await
                    .map_err(|e| e.to_string())?;
                self.platform
                    .stop_deployment(&deployment_id, correlation_id)
                    .await
                    .map(|()| format!("stopped deployment {deployment_id}"))
            }
            RecommendedAction::Rollback => {
                let deployment_id = self
                    .platform
                    .previous_deployment_id(project_id, environment_id, service_id)
                    .await
                    .map_err(|e| e.to_string())?;
                self.platform
                    .rollback_deployment(&deployment_id, correlation_id)
                    .await
                    .map(|()| format!("rolled back to deployment {deployment_id}"))
            }
            RecommendedAction::ScaleMemory => {
                let memory_mb = parameters
                    .get("memory_mb")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| "scale_memory requires a memory_mb parameter".to_string())?;
                self.platform
                    .update_service_limits(
                        environment_id,
                        service_id,
                        memory_mb as u32,
                        correlation_id,
                    )
                    .await
                    .map(|()| format!("memory limit set to {memory_mb} MB"))
            }
            RecommendedAction::ScaleReplicas => {
                let replicas = parameters
                    .get("num_replicas")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| "scale_replicas requires a num_replicas parameter".to_string())?;
                self.platform
                    .update_service_instance(
                        environment_id,
                        service_id,
                        replicas as u32,
                        correlation_id,
                    )
                    .await
                    .map(|()| format!("replica count set to {replicas}"))
            }
            RecommendedAction::Diagnostic | RecommendedAction::None | RecommendedAction::ManualFix => {
                unreachable!("handled above")
            }
        };

        result.map_err(|e| e.to_string())
    }

    fn publish_update(&self, incident_id: Uuid, outcome: &str, message: &str) {
        self.broker.publish(
            topics::REMEDIATION_UPDATES,
            json!({
                "incident_id": incident_id.to_string(),
                "outcome": outcome,
                "message": message,
                "at": Utc::now().to_rfc3339(),
            }),
        );
    }
}
