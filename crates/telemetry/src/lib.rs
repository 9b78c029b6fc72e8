//! Telemetry collector: running aggregates over pipeline events.
//!
//! Components publish loose `{"event": ..., ...}` messages on the
//! `telemetry:events` topic; the collector folds them into counters and
//! running means. Values are best-effort and drift within the collection
//! window; nothing here is durable.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use broker::{topics, Broker};

/// Snapshot of the collector's aggregates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub logs_ingested: u64,
    pub log_throughput_per_min: f64,
    pub incidents_detected: u64,
    pub incidents_ignored: u64,
    pub incidents_resolved: u64,
    pub remediations_succeeded: u64,
    pub remediations_failed: u64,
    pub llm_failures: u64,
    pub alerts_posted: u64,
    pub avg_alert_latency_ms: f64,
    pub avg_remediation_latency_ms: f64,
    pub conversation_replies: u64,
    pub subscriptions_active: u64,
    pub subscriptions_total: u64,
}

#[derive(Debug, Default)]
struct Aggregates {
    snapshot: TelemetrySnapshot,
    alert_latency_sum_ms: f64,
    remediation_latency_sum_ms: f64,
    started_at: Option<std::time::Instant>,
}

impl Aggregates {
    fn fold(&mut self, event: &Value) {
        let Some(name) = event.get("event").and_then(Value::as_str) else {
            return;
        };

        match name {
            "log_ingested" => {
                self.snapshot.logs_ingested += 1;
                if let Some(started) = self.started_at {
                    let minutes = started.elapsed().as_secs_f64() / 60.0;
                    if minutes > 0.0 {
                        self.snapshot.log_throughput_per_min =
                            self.snapshot.logs_ingested as f64 / minutes;
                    }
                }
            }
            "incident_detected" => self.snapshot.incidents_detected += 1,
            "incident_ignored" => self.snapshot.incidents_ignored += 1,
            "llm_failure" => self.snapshot.llm_failures += 1,
            "alert_posted" => {
                self.snapshot.alerts_posted += 1;
                if let Some(latency) = event.get("alert_latency_ms").and_then(Value::as_f64) {
                    self.alert_latency_sum_ms += latency;
                    self.snapshot.avg_alert_latency_ms =
                        self.alert_latency_sum_ms / self.snapshot.alerts_posted as f64;
                }
            }
            "remediation_completed" => {
                match event.get("outcome").and_then(Value::as_str) {
                    Some("succeeded") => {
                        self.snapshot.remediations_succeeded += 1;
                        self.snapshot.incidents_resolved += 1;
                        if let Some(latency) =
                            event.get("remediation_latency_ms").and_then(Value::as_f64)
                        {
                            self.remediation_latency_sum_ms += latency;
                            self.snapshot.avg_remediation_latency_ms = self
                                .remediation_latency_sum_ms
                                / self.snapshot.remediations_succeeded as f64;
                        }
                    }
                    Some("failed") => self.snapshot.remediations_failed += 1,
                    _ => {}
                }
            }
            "conversation_reply" => self.snapshot.conversation_replies += 1,
            "subscriptions" => {
                if let Some(active) = event.get("active").and_then(Value::as_u64) {
                    self.snapshot.subscriptions_active = active;
                }
                if let Some(total) = event.get("total").and_then(Value::as_u64) {
                    self.snapshot.subscriptions_total = total;
                }
            }
            _ => {}
        }
    }
}

/// The collector. Cheap to clone a handle of via [`Collector::snapshot`].
#[derive(Clone)]
pub struct Collector {
    aggregates: Arc<Mutex<Aggregates>>,
    broker: Arc<Broker>,
}

impl Collector {
    #[must_use]
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            aggregates: Arc::new(Mutex::new(Aggregates::default())),
            broker,
        }
    }

    /// Consume telemetry events until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.broker.subscribe(topics::TELEMETRY_EVENTS);
        {
            let mut guard = self.aggregates.lock().unwrap_or_else(|e| e.into_inner());
            guard.started_at = Some(std::time::Instant::now());
        }
        info!("Telemetry collector starting");

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { return };
                    let mut guard = self.aggregates.lock().unwrap_or_else(|e| e.into_inner());
                    guard.fold(&event);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Telemetry collector stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Current aggregates.
    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.aggregates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot
            .clone()
    }

    /// Fold one event synchronously (used by the supervisor stats poller
    /// and by tests).
    pub fn record(&self, event: &Value) {
        let mut guard = self.aggregates.lock().unwrap_or_else(|e| e.into_inner());
        guard.fold(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collector() -> Collector {
        Collector::new(Arc::new(Broker::new()))
    }

    #[test]
    fn counts_incidents_and_remediations() {
        let collector = collector();
        collector.record(&json!({ "event": "incident_detected", "service_id": "s" }));
        collector.record(&json!({ "event": "incident_detected", "service_id": "s" }));
        collector.record(&json!({
            "event": "remediation_completed",
            "outcome": "succeeded",
            "remediation_latency_ms": 1200.0,
        }));
        collector.record(&json!({
            "event": "remediation_completed",
            "outcome": "failed",
        }));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.incidents_detected, 2);
        assert_eq!(snapshot.remediations_succeeded, 1);
        assert_eq!(snapshot.remediations_failed, 1);
        assert_eq!(snapshot.incidents_resolved, 1);
        assert!((snapshot.avg_remediation_latency_ms - 1200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn alert_latency_averages() {
        let collector = collector();
        collector.record(&json!({ "event": "alert_posted", "alert_latency_ms": 100.0 }));
        collector.record(&json!({ "event": "alert_posted", "alert_latency_ms": 300.0 }));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.alerts_posted, 2);
        assert!((snapshot.avg_alert_latency_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_events_are_ignored() {
        let collector = collector();
        collector.record(&json!({ "event": "something_else" }));
        collector.record(&json!({ "no_event_key": true }));
        assert_eq!(collector.snapshot().incidents_detected, 0);
    }

    #[test]
    fn subscription_gauge_overwrites() {
        let collector = collector();
        collector.record(&json!({ "event": "subscriptions", "active": 3, "total": 5 }));
        collector.record(&json!({ "event": "subscriptions", "active": 1, "total": 5 }));
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.subscriptions_active, 1);
        assert_eq!(snapshot.subscriptions_total, 5);
    }
}
