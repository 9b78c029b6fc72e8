//! The log processor task: windows in, incident candidates out.
//!
//! One task owns every per-service window. Pattern matching runs inline on
//! each arrival; LLM classification runs out-of-line in spawned tasks,
//! single-flight per service, and reports back over a channel. Nothing in
//! this task blocks on network I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use ai::{AiResult, ProviderChoice};
use broker::{topics, Broker};
use platform::{IngestQueue, LogEvent};
use store::{IncidentDraft, LlmProviderPref, PolicyCache, Severity, Store, UpsertOutcome};

use crate::classifier::{IncidentClassifier, Judgment};
use crate::fingerprint::fingerprint;
use crate::patterns::{PatternHit, PatternLane};
use crate::window::{ServiceWindow, DEFAULT_WINDOW_SIZE};

/// Confidence assigned to candidates produced directly by the pattern
/// lane.
const PATTERN_CONFIDENCE: f64 = 0.9;

/// Confidence when the LLM lane failed and the pattern lane is the
/// fallback.
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Log lines carried into an incident's context.
const CONTEXT_LINES: usize = 10;

/// Detector tunables.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub window_size: usize,
    /// Tumbling batch window for the LLM lane.
    pub batch_window: Duration,
    pub llm_enabled: bool,
    /// Ceiling on flushing pending batches at shutdown.
    pub shutdown_flush_deadline: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            batch_window: Duration::from_secs(5),
            llm_enabled: true,
            shutdown_flush_deadline: Duration::from_secs(2),
        }
    }
}

struct ClassifyOutcome {
    service_id: String,
    batch: Vec<LogEvent>,
    judgment: AiResult<Judgment>,
}

/// The detector task.
pub struct LogProcessor {
    ingest: Arc<IngestQueue>,
    store: Store,
    broker: Arc<Broker>,
    classifier: Arc<dyn IncidentClassifier>,
    policies: Arc<PolicyCache>,
    config: DetectorConfig,
    lane: PatternLane,
    windows: HashMap<String, ServiceWindow>,
}

impl LogProcessor {
    #[must_use]
    pub fn new(
        ingest: Arc<IngestQueue>,
        store: Store,
        broker: Arc<Broker>,
        classifier: Arc<dyn IncidentClassifier>,
        policies: Arc<PolicyCache>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            ingest,
            store,
            broker,
            classifier,
            policies,
            config,
            lane: PatternLane::new(),
            windows: HashMap::new(),
        }
    }

    /// Run until shutdown. Per-event failures are logged, never fatal.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            window_size = self.config.window_size,
            batch_window_ms = self.config.batch_window.as_millis() as u64,
            llm_enabled = self.config.llm_enabled,
            "Log processor starting"
        );

        let (results_tx, mut results_rx) = mpsc::channel::<ClassifyOutcome>(32);
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let ingest = Arc::clone(&self.ingest);
            tokio::select! {
                event = ingest.recv() => {
                    self.handle_event(event).await;
                }
                outcome = results_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.handle_outcome(outcome).await;
                    }
                }
                _ = tick.tick() => {
                    self.dispatch_due_batches(&results_tx).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.flush_on_shutdown().await;
                        info!("Log processor stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: LogEvent) {
        let service_id = event.service_id.clone();

        // Raw fan-out for dashboard consumers, then telemetry.
        if let Ok(value) = serde_json::to_value(&event) {
            self.broker.publish(&topics::service_logs(&service_id), value);
        }
        self.broker.publish(
            topics::TELEMETRY_EVENTS,
            json!({ "event": "log_ingested", "service_id": service_id }),
        );

        let window = self
            .windows
            .entry(service_id.clone())
            .or_insert_with(|| ServiceWindow::new(self.config.window_size));
        window.push(event.clone());

        let hit = self.lane.evaluate(&event, &mut window.timeout_hits);
        if let Some(hit) = hit {
            window.last_pattern = Some(hit.clone());

            if hit.severity == Severity::Critical {
                // Pattern lane already reached critical: no LLM round trip.
                let batch = window.batch();
                if let Some(draft) = draft_from_pattern(&hit, &batch, PATTERN_CONFIDENCE) {
                    self.upsert_and_publish(draft).await;
                }
                return;
            }
        }

        if self.config.llm_enabled && window.qualifies_for_llm() {
            if window.inflight {
                window.retrigger = true;
            } else if window.batch_deadline.is_none() {
                window.batch_deadline = Some(Instant::now() + self.config.batch_window);
            }
        } else if let Some(hit) = window.last_pattern.take() {
            // The LLM lane will not see this window (disabled, or nothing
            // scored high enough to trigger it, as with a warn-level
            // timeout burst). The pattern hit is the candidate.
            let batch = window.batch();
            if let Some(draft) = draft_from_pattern(&hit, &batch, FALLBACK_CONFIDENCE) {
                self.upsert_and_publish(draft).await;
            }
        }
    }

    async fn dispatch_due_batches(&mut self, results_tx: &mpsc::Sender<ClassifyOutcome>) {
        let now = Instant::now();
        let due: Vec<String> = self
            .windows
            .iter()
            .filter(|(_, w)| {
                !w.inflight
                    && !w.events.is_empty()
                    && w.batch_deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|(service_id, _)| service_id.clone())
            .collect();

        for service_id in due {
            let (batch, service_name) = {
                let Some(window) = self.windows.get_mut(&service_id) else {
                    continue;
                };
                window.batch_deadline = None;
                window.inflight = true;
                (window.batch(), window.display_name(&service_id))
            };

            let choice = self.provider_choice(&service_id, &service_name).await;
            let classifier = Arc::clone(&self.classifier);
            let results_tx = results_tx.clone();

            tokio::spawn(async move {
                let judgment = classifier.classify(&service_name, &batch, choice).await;
                let _ = results_tx
                    .send(ClassifyOutcome {
                        service_id,
                        batch,
                        judgment,
                    })
                    .await;
            });
        }
    }

    async fn handle_outcome(&mut self, outcome: ClassifyOutcome) {
        let pattern_fallback = {
            let Some(window) = self.windows.get_mut(&outcome.service_id) else {
                return;
            };
            window.inflight = false;
            if window.retrigger {
                window.retrigger = false;
                window.batch_deadline = Some(Instant::now() + self.config.batch_window);
            }
            window.last_pattern.clone()
        };

        let draft = match outcome.judgment {
            Ok(judgment) => {
                if judgment.severity == Severity::Low
                    && judgment.recommended_action == store::RecommendedAction::None
                {
                    debug!(
                        service_id = %outcome.service_id,
                        "LLM judged the window as noise; no candidate"
                    );
                    return;
                }
                draft_from_judgment(&judgment, &outcome.batch)
            }
            Err(e) => {
                warn!(
                    service_id = %outcome.service_id,
                    error = %e,
                    "LLM lane failed, falling back to pattern result"
                );
                self.broker.publish(
                    topics::TELEMETRY_EVENTS,
                    json!({ "event": "llm_failure", "service_id": outcome.service_id }),
                );
                match pattern_fallback {
                    Some(hit) => draft_from_pattern(&hit, &outcome.batch, FALLBACK_CONFIDENCE),
                    None => return,
                }
            }
        };

        if let Some(draft) = draft {
            self.upsert_and_publish(draft).await;
        }
    }

    async fn provider_choice(&self, service_id: &str, service_name: &str) -> ProviderChoice {
        match self.policies.get(service_id, service_name).await {
            Ok(policy) => match policy.llm_provider {
                LlmProviderPref::Openai => ProviderChoice::Openai,
                LlmProviderPref::Anthropic => ProviderChoice::Anthropic,
                LlmProviderPref::Auto => ProviderChoice::Auto,
            },
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "Policy lookup failed; using auto provider");
                ProviderChoice::Auto
            }
        }
    }

    async fn upsert_and_publish(&self, draft: IncidentDraft) {
        let outcome = match self.store.upsert_incident(&draft).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    service_id = %draft.service_id,
                    fingerprint = %draft.fingerprint,
                    error = %e,
                    "Incident upsert failed"
                );
                return;
            }
        };

        match &outcome {
            UpsertOutcome::Created(incident) | UpsertOutcome::Updated(incident) => {
                let payload = match serde_json::to_value(incident) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Incident serialization failed");
                        return;
                    }
                };

                info!(
                    incident_id = %incident.id,
                    service_id = %incident.service_id,
                    severity = incident.severity.as_str(),
                    fingerprint = %incident.fingerprint,
                    created = matches!(outcome, UpsertOutcome::Created(_)),
                    "Incident candidate persisted"
                );

                self.broker.publish(topics::INCIDENTS_NEW, payload.clone());
                self.broker.publish(topics::DASHBOARD_INCIDENTS, payload);
                self.broker.publish(
                    topics::TELEMETRY_EVENTS,
                    json!({
                        "event": "incident_detected",
                        "service_id": incident.service_id,
                        "severity": incident.severity.as_str(),
                    }),
                );
            }
            UpsertOutcome::Skipped(incident) => {
                debug!(
                    incident_id = %incident.id,
                    status = incident.status.as_str(),
                    "Upsert skipped terminal incident"
                );
            }
        }
    }

    /// Best-effort flush of pending batches using the pattern fallback;
    /// bounded by the shutdown deadline.
    async fn flush_on_shutdown(&mut self) {
        let pending: Vec<(Option<PatternHit>, Vec<LogEvent>)> = self
            .windows
            .values()
            .filter(|w| w.batch_deadline.is_some() || w.inflight || w.retrigger)
            .map(|w| (w.last_pattern.clone(), w.batch()))
            .collect();

        if pending.is_empty() {
            return;
        }

        debug!(batches = pending.len(), "Flushing pending batches at shutdown");
        let deadline = self.config.shutdown_flush_deadline;
        let flush = async {
            for (hit, batch) in pending {
                if let Some(hit) = hit {
                    if let Some(draft) = draft_from_pattern(&hit, &batch, FALLBACK_CONFIDENCE) {
                        self.upsert_and_publish(draft).await;
                    }
                }
            }
        };

        if tokio::time::timeout(deadline, flush).await.is_err() {
            warn!("Shutdown flush exceeded its deadline");
        }
    }
}

impl ServiceWindow {
    fn display_name(&self, service_id: &str) -> String {
        self.service_name
            .clone()
            .unwrap_or_else(|| service_id.to_string())
    }
}

fn log_context(batch: &[LogEvent]) -> Value {
    let lines: Vec<String> = batch
        .iter()
        .rev()
        .take(CONTEXT_LINES)
        .rev()
        .map(|e| {
            format!(
                "[{}] {} {}",
                e.timestamp.format("%H:%M:%S"),
                e.level.as_str(),
                e.message
            )
        })
        .collect();
    json!({ "lines": lines })
}

fn anchor<'a>(batch: &'a [LogEvent]) -> Option<&'a LogEvent> {
    let max_score = batch.iter().map(|e| e.severity_score).max()?;
    batch.iter().rev().find(|e| e.severity_score == max_score)
}

fn base_draft(batch: &[LogEvent]) -> Option<(IncidentDraft, &LogEvent)> {
    let anchor = anchor(batch)?;
    let draft = IncidentDraft {
        service_id: anchor.service_id.clone(),
        service_name: anchor
            .service_name
            .clone()
            .unwrap_or_else(|| anchor.service_id.clone()),
        environment_id: anchor.environment_id.clone(),
        fingerprint: fingerprint(&anchor.message, anchor.level, &anchor.service_id),
        severity: Severity::Low,
        confidence: 0.0,
        root_cause: None,
        recommended_action: store::RecommendedAction::None,
        reasoning: None,
        log_context: log_context(batch),
        metadata: json!({}),
    };
    Some((draft, anchor))
}

/// Candidate from a pattern hit.
fn draft_from_pattern(
    hit: &PatternHit,
    batch: &[LogEvent],
    confidence: f64,
) -> Option<IncidentDraft> {
    let (mut draft, _anchor) = base_draft(batch)?;
    draft.severity = hit.severity;
    draft.confidence = confidence;
    draft.root_cause = Some(hit.root_cause.to_string());
    draft.recommended_action = hit.recommended_action;
    draft.reasoning = Some("pattern match".to_string());
    Some(draft)
}

/// Candidate from an LLM judgment.
fn draft_from_judgment(judgment: &Judgment, batch: &[LogEvent]) -> Option<IncidentDraft> {
    let (mut draft, _anchor) = base_draft(batch)?;
    draft.severity = judgment.severity;
    draft.confidence = judgment.confidence;
    draft.root_cause = judgment.root_cause.clone();
    draft.recommended_action = judgment.recommended_action;
    draft.reasoning = judgment.reasoning.clone();
    Some(draft)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use platform::LogLevel;
    use std::collections::HashMap as StdHashMap;
    use store::RecommendedAction;

    fn event(service_id: &str, level: LogLevel, message: &str) -> LogEvent {
        LogEvent {
            service_id: service_id.to_string(),
            environment_id: Some("env-1".to_string()),
            service_name: Some("api".to_string()),
            timestamp: Utc::now(),
            level,
            severity_score: level.score(),
            message: message.to_string(),
            raw_metadata: StdHashMap::new(),
            source: None,
        }
    }

    #[test]
    fn empty_batch_produces_no_draft() {
        let hit = PatternHit {
            severity: Severity::Critical,
            rule: "oom",
            recommended_action: RecommendedAction::ScaleMemory,
            root_cause: "oom",
        };
        assert!(draft_from_pattern(&hit, &[], PATTERN_CONFIDENCE).is_none());
    }

    #[test]
    fn draft_anchors_on_highest_severity() {
        let batch = vec![
            event("svc-1", LogLevel::Info, "starting"),
            event("svc-1", LogLevel::Fatal, "FATAL: out of memory"),
            event("svc-1", LogLevel::Info, "noise"),
        ];
        let hit = PatternHit {
            severity: Severity::Critical,
            rule: "oom",
            recommended_action: RecommendedAction::ScaleMemory,
            root_cause: "oom",
        };
        let draft = draft_from_pattern(&hit, &batch, PATTERN_CONFIDENCE).unwrap();

        assert_eq!(draft.severity, Severity::Critical);
        assert_eq!(
            draft.fingerprint,
            fingerprint("FATAL: out of memory", LogLevel::Fatal, "svc-1")
        );
        assert_eq!(draft.reasoning.as_deref(), Some("pattern match"));
    }

    #[test]
    fn context_is_bounded() {
        let batch: Vec<LogEvent> = (0..30)
            .map(|i| event("svc-1", LogLevel::Error, &format!("err {i}")))
            .collect();
        let context = log_context(&batch);
        let lines = context["lines"].as_array().unwrap();
        assert_eq!(lines.len(), CONTEXT_LINES);
        // Newest lines are kept.
        assert!(lines.last().unwrap().as_str().unwrap().contains("err 29"));
    }
}
