//! Topic names used by the pipeline.

/// New or refreshed incidents from the detector.
pub const INCIDENTS_NEW: &str = "incidents:new";

/// Incident stream for the dashboard view.
pub const DASHBOARD_INCIDENTS: &str = "dashboard:incidents";

/// Conversation lifecycle events (`start_chat`, inbound messages).
pub const CONVERSATIONS_EVENTS: &str = "conversations:events";

/// Remediation intents (`auto_fix_requested`).
pub const REMEDIATION_ACTIONS: &str = "remediation:actions";

/// Remediation outcomes, consumed by the notifier.
pub const REMEDIATION_UPDATES: &str = "remediation:updates";

/// Counter/latency events for the telemetry collector.
pub const TELEMETRY_EVENTS: &str = "telemetry:events";

/// Policy mutations; invalidates the read cache.
pub const POLICIES_UPDATED: &str = "policies:updated";

/// Per-service raw log stream.
#[must_use]
pub fn service_logs(service_id: &str) -> String {
    format!("railway:logs:{service_id}")
}

/// Per-project connection health stream.
#[must_use]
pub fn project_connections(project_id: &str) -> String {
    format!("railway:connections:{project_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_topics() {
        assert_eq!(service_logs("svc-1"), "railway:logs:svc-1");
        assert_eq!(project_connections("p-1"), "railway:connections:p-1");
    }
}
