//! End-to-end detector scenarios: events in, incidents and publications
//! out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use ai::{AiError, AiResult, ProviderChoice};
use broker::{topics, Broker};
use detect::{DetectorConfig, IncidentClassifier, Judgment, LogProcessor};
use platform::{IngestQueue, LogEvent, LogLevel};
use store::{IncidentStatus, PolicyCache, RecommendedAction, Severity, Store};

struct StubClassifier {
    calls: AtomicUsize,
    judgment: Option<Judgment>,
}

impl StubClassifier {
    fn noop() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            judgment: None,
        })
    }

    fn with_judgment(judgment: Judgment) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            judgment: Some(judgment),
        })
    }
}

#[async_trait]
impl IncidentClassifier for StubClassifier {
    async fn classify(
        &self,
        _service_name: &str,
        _events: &[LogEvent],
        _choice: ProviderChoice,
    ) -> AiResult<Judgment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.judgment {
            Some(judgment) => Ok(judgment.clone()),
            None => Err(AiError::NotConfigured),
        }
    }
}

fn event(service_id: &str, level: LogLevel, message: &str) -> LogEvent {
    LogEvent {
        service_id: service_id.to_string(),
        environment_id: Some("env-1".to_string()),
        service_name: Some("api".to_string()),
        timestamp: Utc::now(),
        level,
        severity_score: level.score(),
        message: message.to_string(),
        raw_metadata: HashMap::new(),
        source: None,
    }
}

struct Harness {
    store: Store,
    broker: Arc<Broker>,
    ingest: Arc<IngestQueue>,
    shutdown: watch::Sender<bool>,
}

async fn start_processor(classifier: Arc<StubClassifier>, config: DetectorConfig) -> Harness {
    let store = Store::open_in_memory().await.unwrap();
    let broker = Arc::new(Broker::new());
    let ingest = IngestQueue::new(1_000);
    let policies = Arc::new(PolicyCache::new(store.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor = LogProcessor::new(
        Arc::clone(&ingest),
        store.clone(),
        Arc::clone(&broker),
        classifier,
        policies,
        config,
    );
    tokio::spawn(processor.run(shutdown_rx));

    Harness {
        store,
        broker,
        ingest,
        shutdown: shutdown_tx,
    }
}

#[tokio::test]
async fn critical_oom_creates_incident_and_publishes() {
    let harness = start_processor(StubClassifier::noop(), DetectorConfig::default()).await;
    let mut incidents_new = harness.broker.subscribe(topics::INCIDENTS_NEW);
    let mut dashboard = harness.broker.subscribe(topics::DASHBOARD_INCIDENTS);

    harness.ingest.push(event(
        "svc-1",
        LogLevel::Fatal,
        "FATAL: Out of memory - killed by OOM killer",
    ));

    let published = tokio::time::timeout(Duration::from_secs(6), incidents_new.recv())
        .await
        .expect("incident published within 6s")
        .unwrap();
    assert_eq!(published["service_id"], "svc-1");

    let severity = published["severity"].as_str().unwrap();
    assert!(severity == "critical" || severity == "high");
    let action = published["recommended_action"].as_str().unwrap();
    assert!(action == "restart" || action == "scale_memory");

    // The dashboard stream saw the same incident.
    let mirrored = tokio::time::timeout(Duration::from_secs(1), dashboard.recv())
        .await
        .expect("dashboard publication")
        .unwrap();
    assert_eq!(mirrored["id"], published["id"]);

    let open = harness.store.open_incidents().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, IncidentStatus::Detected);

    let _ = harness.shutdown.send(true);
}

#[tokio::test]
async fn repeated_oom_deduplicates_to_one_row() {
    let harness = start_processor(StubClassifier::noop(), DetectorConfig::default()).await;
    let mut incidents_new = harness.broker.subscribe(topics::INCIDENTS_NEW);

    for _ in 0..3 {
        harness.ingest.push(event(
            "svc-1",
            LogLevel::Fatal,
            "FATAL: Out of memory - killed by OOM killer",
        ));
    }

    // All three upserts publish (one created, two updated)...
    let mut ids = Vec::new();
    for _ in 0..3 {
        let published = tokio::time::timeout(Duration::from_secs(6), incidents_new.recv())
            .await
            .expect("publication")
            .unwrap();
        ids.push(published["id"].as_str().unwrap().to_string());
    }
    assert!(ids.iter().all(|id| *id == ids[0]));

    // ...but exactly one row exists.
    let open = harness.store.open_incidents().await.unwrap();
    assert_eq!(open.len(), 1);

    let _ = harness.shutdown.send(true);
}

#[tokio::test]
async fn info_noise_creates_nothing() {
    let classifier = StubClassifier::noop();
    let harness = start_processor(Arc::clone(&classifier), DetectorConfig::default()).await;

    for _ in 0..25 {
        harness
            .ingest
            .push(event("svc-1", LogLevel::Info, "Starting server on port 4000"));
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(harness.store.open_incidents().await.unwrap().is_empty());
    // A batch that never qualifies must not reach the classifier.
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);

    let _ = harness.shutdown.send(true);
}

#[tokio::test]
async fn warn_level_timeout_burst_becomes_medium_without_llm_round_trip() {
    // Three timeout signals inside the 60s window, all warn-level: the
    // LLM lane never triggers (nothing scores >= 4), but the pattern
    // candidate must still land.
    let classifier = StubClassifier::noop();
    let harness = start_processor(Arc::clone(&classifier), DetectorConfig::default()).await;
    let mut incidents_new = harness.broker.subscribe(topics::INCIDENTS_NEW);

    harness
        .ingest
        .push(event("svc-1", LogLevel::Warn, "request timeout on /api/users"));
    harness
        .ingest
        .push(event("svc-1", LogLevel::Warn, "deadline exceeded calling billing"));
    harness
        .ingest
        .push(event("svc-1", LogLevel::Warn, "request timeout on /api/orders"));

    let published = tokio::time::timeout(Duration::from_secs(6), incidents_new.recv())
        .await
        .expect("timeout-burst incident published")
        .unwrap();

    assert_eq!(published["severity"], "medium");
    assert_eq!(published["reasoning"], "pattern match");
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);

    let open = harness.store.open_incidents().await.unwrap();
    assert_eq!(open.len(), 1);

    let _ = harness.shutdown.send(true);
}

#[tokio::test]
async fn llm_judgment_shapes_the_incident() {
    let classifier = StubClassifier::with_judgment(Judgment {
        severity: Severity::High,
        root_cause: Some("database connection pool exhausted".to_string()),
        recommended_action: RecommendedAction::ScaleReplicas,
        confidence: 0.92,
        reasoning: Some("repeated refusals under load".to_string()),
    });
    let config = DetectorConfig {
        batch_window: Duration::from_millis(100),
        ..DetectorConfig::default()
    };
    let harness = start_processor(Arc::clone(&classifier), config).await;
    let mut incidents_new = harness.broker.subscribe(topics::INCIDENTS_NEW);

    harness.ingest.push(event(
        "svc-1",
        LogLevel::Error,
        "connect ECONNREFUSED db:5432",
    ));

    let published = tokio::time::timeout(Duration::from_secs(6), incidents_new.recv())
        .await
        .expect("incident published")
        .unwrap();

    assert_eq!(published["severity"], "high");
    assert_eq!(published["recommended_action"], "scale_replicas");
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);

    let _ = harness.shutdown.send(true);
}

#[tokio::test]
async fn llm_failure_falls_back_to_pattern_with_reduced_confidence() {
    // noop stub fails every call.
    let config = DetectorConfig {
        batch_window: Duration::from_millis(100),
        ..DetectorConfig::default()
    };
    let harness = start_processor(StubClassifier::noop(), config).await;
    let mut incidents_new = harness.broker.subscribe(topics::INCIDENTS_NEW);

    harness.ingest.push(event(
        "svc-1",
        LogLevel::Error,
        "connect ECONNREFUSED db:5432",
    ));

    let published = tokio::time::timeout(Duration::from_secs(6), incidents_new.recv())
        .await
        .expect("fallback incident published")
        .unwrap();

    assert_eq!(published["severity"], "high");
    assert_eq!(published["reasoning"], "pattern match");
    let confidence = published["confidence"].as_f64().unwrap();
    assert!(confidence <= 0.5);

    let _ = harness.shutdown.send(true);
}
