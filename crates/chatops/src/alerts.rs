//! Alert listener: couples new incidents to Slack alerts and remediation
//! outcomes to thread updates.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use broker::topics;
use store::Incident;

use crate::webhook::ChatDeps;
use crate::ChatError;

/// Subscribes to `incidents:new` and `remediation:updates`.
pub struct AlertListener {
    deps: Arc<ChatDeps>,
}

impl AlertListener {
    #[must_use]
    pub fn new(deps: Arc<ChatDeps>) -> Self {
        Self { deps }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut incidents = self.deps.broker.subscribe(topics::INCIDENTS_NEW);
        let mut updates = self.deps.broker.subscribe(topics::REMEDIATION_UPDATES);

        info!("Alert listener starting");
        loop {
            tokio::select! {
                incident = incidents.recv() => {
                    let Some(incident) = incident else { return };
                    self.handle_incident(incident).await;
                }
                update = updates.recv() => {
                    let Some(update) = update else { return };
                    self.handle_update(&update).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Alert listener stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_incident(&self, payload: Value) {
        let published: Incident = match serde_json::from_value(payload) {
            Ok(incident) => incident,
            Err(e) => {
                warn!(error = %e, "Unparseable incident payload");
                return;
            }
        };

        // Re-read the stored row: the published payload predates any
        // thread bookkeeping a racing recurrence may have written.
        let incident = match self.deps.store.incident(published.id).await {
            Ok(incident) => incident,
            Err(e) => {
                warn!(incident_id = %published.id, error = %e, "Alerting an unknown incident");
                return;
            }
        };

        // Deduplicated recurrence: the alert already exists, one post per
        // incident.
        if incident.metadata.get("thread_ts").is_some() {
            debug!(incident_id = %incident.id, "Incident already alerted; skipping post");
            return;
        }

        let ts = match self.deps.notifier.send_incident_alert(&incident).await {
            Ok(ts) => ts,
            Err(ChatError::NotConfigured) => {
                debug!("Slack unconfigured; incident alert suppressed");
                return;
            }
            Err(e) => {
                warn!(incident_id = %incident.id, error = %e, "Incident alert failed");
                return;
            }
        };

        if let Err(e) = self
            .deps
            .store
            .merge_incident_metadata(incident.id, "thread_ts", json!(ts))
            .await
        {
            warn!(incident_id = %incident.id, error = %e, "Could not record thread_ts");
        }

        let alert_latency_ms = (Utc::now() - incident.detected_at).num_milliseconds();
        self.deps.broker.publish(
            topics::TELEMETRY_EVENTS,
            json!({
                "event": "alert_posted",
                "service_id": incident.service_id,
                "alert_latency_ms": alert_latency_ms,
            }),
        );
        info!(
            incident_id = %incident.id,
            thread_ts = %ts,
            alert_latency_ms,
            "Incident alert posted"
        );
    }

    async fn handle_update(&self, update: &Value) {
        let incident_id = update.get("incident_id").and_then(Value::as_str);
        let outcome = update.get("outcome").and_then(Value::as_str).unwrap_or("");
        let message = update.get("message").and_then(Value::as_str).unwrap_or("");

        let Some(incident_id) = incident_id.and_then(|id| id.parse().ok()) else {
            return;
        };
        let Ok(incident) = self.deps.store.incident(incident_id).await else {
            return;
        };

        let text = match outcome {
            "succeeded" => format!(":white_check_mark: Remediation succeeded: {message}"),
            "failed" => format!(":x: Remediation failed: {message}"),
            "started" => format!(":gear: Remediation started: {message}"),
            "skipped" => format!(":information_source: Remediation skipped: {message}"),
            _ => return,
        };

        let result = match incident.metadata.get("thread_ts").and_then(Value::as_str) {
            Some(ts) => self.deps.notifier.post_thread_reply(ts, &text).await,
            None => self.deps.notifier.post_channel_message(&text).await,
        };

        match result {
            Ok(_) => {}
            Err(ChatError::NotConfigured) => {
                debug!("Slack unconfigured; remediation update suppressed");
            }
            Err(e) => warn!(incident_id = %incident.id, error = %e, "Remediation update post failed"),
        }
    }
}
