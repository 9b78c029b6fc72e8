//! Startup recovery of stale remediation actions.
//!
//! An action left `pending`/`in_progress` across a restart is re-evaluated
//! against live platform state instead of being blindly re-issued: if the
//! service's latest deployment reports healthy, the action is closed as
//! succeeded; otherwise it is failed so a fresh signal can reopen the
//! incident cleanly.

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use tracing::{info, warn};

use broker::{topics, Broker};
use platform::RailwayClient;
use store::{IncidentStatus, Store, StoreResult};

/// Actions older than this are considered stale at startup.
const STALE_AFTER_MINUTES: i64 = 10;

/// Deployment statuses treated as healthy when recovering.
const HEALTHY_STATUSES: &[&str] = &["SUCCESS", "DEPLOYED", "COMPLETED"];

/// Re-evaluate non-terminal actions left over from a previous run.
/// Returns the number of actions recovered.
pub async fn recover_stale_actions(
    store: &Store,
    platform: &Arc<RailwayClient>,
    broker: &Arc<Broker>,
    project_id: Option<&str>,
) -> StoreResult<usize> {
    let stale = store
        .stale_actions(Duration::minutes(STALE_AFTER_MINUTES))
        .await?;
    if stale.is_empty() {
        return Ok(0);
    }

    info!(count = stale.len(), "Recovering stale remediation actions");
    let mut recovered = 0usize;

    for action in stale {
        let incident = match store.incident(action.incident_id).await {
            Ok(incident) => incident,
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "Stale action without incident");
                store
                    .fail_action(action.id, "orphaned action: incident missing")
                    .await?;
                continue;
            }
        };

        let healthy = match &incident.environment_id {
            Some(environment_id) => {
                match platform
                    .latest_deployment_id(
                        project_id.unwrap_or_default(),
                        environment_id,
                        &incident.service_id,
                    )
                    .await
                {
                    Ok(deployment_id) => platform
                        .deployment_status(&deployment_id)
                        .await
                        .map(|status| {
                            HEALTHY_STATUSES
                                .iter()
                                .any(|h| status.eq_ignore_ascii_case(h))
                        })
                        .unwrap_or(false),
                    Err(_) => false,
                }
            }
            None => false,
        };

        if healthy {
            store
                .complete_action(action.id, "recovered after restart: deployment healthy")
                .await?;
            if incident.status == IncidentStatus::AwaitingAction {
                let _ = store
                    .transition_incident(incident.id, IncidentStatus::AutoRemediated)
                    .await;
            }
            broker.publish(
                topics::REMEDIATION_UPDATES,
                json!({
                    "incident_id": incident.id.to_string(),
                    "outcome": "succeeded",
                    "message": "recovered after restart: deployment healthy",
                }),
            );
        } else {
            store
                .fail_action(action.id, "stale action expired during restart")
                .await?;
            if incident.status == IncidentStatus::AwaitingAction {
                let _ = store
                    .transition_incident(incident.id, IncidentStatus::Failed)
                    .await;
            }
            broker.publish(
                topics::REMEDIATION_UPDATES,
                json!({
                    "incident_id": incident.id.to_string(),
                    "outcome": "failed",
                    "message": "stale action expired during restart",
                }),
            );
        }
        recovered += 1;
    }

    Ok(recovered)
}
