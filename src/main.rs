//! railguard: Railway service monitor with Slack-driven remediation.
//!
//! Wires the pipeline together: platform subscriptions -> detector ->
//! incident store -> broker -> Slack notifier -> remediation coordinator,
//! plus the webhook/health HTTP surface and the background sweeps.

mod config;
mod health;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use ai::ProviderRegistry;
use broker::{topics, Broker};
use chatops::webhook::{webhook_router, ChatDeps, WebhookState};
use chatops::{AlertListener, ConversationManager, SlackNotifier};
use detect::{DetectorConfig, LlmClassifier, LogProcessor};
use platform::{
    IngestQueue, MonitoringTarget, RailwayClient, SubscriptionConfig, SubscriptionSupervisor,
    SupervisorConfig,
};
use store::{PolicyCache, RetentionWorker, Store};
use telemetry::Collector;

use config::Config;
use health::{health, HealthState};

/// Interval for supervisor stats publication.
const STATS_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "railguard")]
#[command(about = "Railway incident monitor: log streams in, remediations out")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor (default).
    Run,
    /// Print the resolved feature gates and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => check_config(),
        Commands::Run => run().await,
    }
}

fn check_config() -> Result<()> {
    let config = Config::from_env();
    let gates = config.gates();

    println!("environment: {:?}", config.run_env);
    println!("platform:    {}", enabled(gates.platform));
    println!("slack:       {}", enabled(gates.slack));
    println!("llm:         {}", enabled(gates.llm));
    println!(
        "targets:     {}",
        MonitoringTarget::expand(
            &config.platform.projects,
            &config.platform.environments,
            &config.platform.services,
        )
        .len()
    );
    Ok(())
}

const fn enabled(on: bool) -> &'static str {
    if on {
        "enabled"
    } else {
        "disabled"
    }
}

#[allow(clippy::too_many_lines)]
async fn run() -> Result<()> {
    let config = Config::load().context("configuration invalid")?;
    let gates = config.gates();
    info!(
        env = ?config.run_env,
        platform = gates.platform,
        slack = gates.slack,
        llm = gates.llm,
        "railguard starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Database, with a short startup grace window for the volume to come
    // up.
    let store = open_store_with_retry(&config.database_path).await?;
    let policies = Arc::new(PolicyCache::new(store.clone()));

    let broker = Arc::new(Broker::new());
    let registry = Arc::new(ProviderRegistry::from_env());

    let platform_client = Arc::new(RailwayClient::new(
        config.platform.api_token.clone(),
        config.performance.rate_limit_sec,
        config.performance.rate_limit_hr,
    ));

    // Subscriptions.
    let ingest = IngestQueue::new(config.performance.buffer_capacity);
    let supervisor_config = SupervisorConfig {
        max_restarts_per_hour: config.performance.max_retry_attempts,
        stop_timeout: Duration::from_secs(5),
        subscription: SubscriptionConfig {
            connection_timeout: config.performance.connection_timeout,
            heartbeat_interval: config.performance.heartbeat_interval,
            heartbeat_timeout: config.performance.heartbeat_timeout,
            max_backoff_ms: config.performance.max_backoff.as_millis() as u64,
            ..SubscriptionConfig::default()
        },
    };
    let supervisor = Arc::new(SubscriptionSupervisor::new(
        config.platform.api_token.clone(),
        Arc::clone(&ingest),
        supervisor_config,
        shutdown_rx.clone(),
    ));

    if gates.platform {
        let targets = MonitoringTarget::expand(
            &config.platform.projects,
            &config.platform.environments,
            &config.platform.services,
        );
        info!(count = targets.len(), "Starting log subscriptions");
        for target in &targets {
            if let Err(e) = supervisor.start(target) {
                error!(target = %target, error = %e, "Subscription start failed");
            }
        }
    } else {
        warn!("Platform feature disabled (token or projects missing); no log ingestion");
    }

    // Detector.
    let classifier = Arc::new(LlmClassifier::new(Arc::clone(&registry)));
    let detector_config = DetectorConfig {
        batch_window: config.performance.batch_window,
        llm_enabled: gates.llm,
        ..DetectorConfig::default()
    };
    let processor = LogProcessor::new(
        Arc::clone(&ingest),
        store.clone(),
        Arc::clone(&broker),
        classifier,
        Arc::clone(&policies),
        detector_config,
    );
    tokio::spawn(processor.run(shutdown_rx.clone()));

    // Chat layer.
    let notifier = Arc::new(SlackNotifier::new(
        config.slack.bot_token.clone(),
        config.slack.channel_id.clone(),
    ));
    if !notifier.is_configured() {
        warn!("Slack feature disabled; alerts will be suppressed");
    }
    let chat_deps = Arc::new(ChatDeps {
        store: store.clone(),
        broker: Arc::clone(&broker),
        notifier: Arc::clone(&notifier),
        platform: Arc::clone(&platform_client),
        registry: Arc::clone(&registry),
    });
    tokio::spawn(AlertListener::new(Arc::clone(&chat_deps)).run(shutdown_rx.clone()));

    let default_project = config.platform.projects.first().cloned();
    tokio::spawn(
        ConversationManager::new(Arc::clone(&chat_deps), default_project.clone())
            .run(shutdown_rx.clone()),
    );

    // Remediation: recover leftovers first, then start the coordinator.
    match remediate::recover_stale_actions(
        &store,
        &platform_client,
        &broker,
        default_project.as_deref(),
    )
    .await
    {
        Ok(0) => {}
        Ok(count) => info!(count, "Recovered stale remediation actions"),
        Err(e) => warn!(error = %e, "Stale action recovery failed"),
    }
    let coordinator = remediate::RemediationCoordinator::new(
        store.clone(),
        Arc::clone(&policies),
        Arc::clone(&platform_client),
        Arc::clone(&broker),
        default_project.clone(),
    );
    tokio::spawn(coordinator.run(shutdown_rx.clone()));

    // Telemetry, retention, policy cache invalidation, stats publication.
    let collector = Collector::new(Arc::clone(&broker));
    tokio::spawn(collector.clone().run(shutdown_rx.clone()));

    let retention = RetentionWorker::new(store.clone(), config.performance.retention_days);
    tokio::spawn(retention.run(shutdown_rx.clone()));

    tokio::spawn(invalidate_policies_on_update(
        Arc::clone(&broker),
        Arc::clone(&policies),
        shutdown_rx.clone(),
    ));
    tokio::spawn(publish_connection_stats(
        Arc::clone(&broker),
        Arc::clone(&supervisor),
        config.platform.projects.clone(),
        shutdown_rx.clone(),
    ));

    // HTTP surface: health, telemetry snapshot, Slack webhooks.
    let health_state = HealthState {
        pool: store.pool().clone(),
        supervisor: Arc::clone(&supervisor),
        platform_enabled: gates.platform,
    };
    let telemetry_handle = collector.clone();
    let app = Router::new()
        .route("/health", get(health).with_state(health_state))
        .route(
            "/telemetry",
            get(move || {
                let collector = telemetry_handle.clone();
                async move { axum::Json(collector.snapshot()) }
            }),
        )
        .merge(webhook_router(WebhookState {
            signing_secret: config.slack.signing_secret.clone(),
            deps: Arc::clone(&chat_deps),
        }))
        .layer(TraceLayer::new_for_http());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("http server failed")?;

    // Drain: flip the shared shutdown flag, then close the subscriptions
    // gracefully.
    let _ = shutdown_tx.send(true);
    supervisor.stop_all().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("railguard stopped");
    Ok(())
}

async fn open_store_with_retry(path: &str) -> Result<Store> {
    let mut attempt = 0u32;
    loop {
        match Store::open(path).await {
            Ok(store) => return Ok(store),
            Err(e) if attempt < 3 => {
                attempt += 1;
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                warn!(error = %e, attempt, delay_s = delay.as_secs(), "Database open failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e).context("database unavailable"),
        }
    }
}

async fn invalidate_policies_on_update(
    broker: Arc<Broker>,
    policies: Arc<PolicyCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut updates = broker.subscribe(topics::POLICIES_UPDATED);
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { return };
                let service_id = update.get("service_id").and_then(serde_json::Value::as_str);
                policies.invalidate(service_id);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn publish_connection_stats(
    broker: Arc<Broker>,
    supervisor: Arc<SubscriptionSupervisor>,
    projects: Vec<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(STATS_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let stats = supervisor.connection_stats();
                let connected = stats.iter().filter(|s| s.connected).count() as u64;
                broker.publish(
                    topics::TELEMETRY_EVENTS,
                    json!({
                        "event": "subscriptions",
                        "active": connected,
                        "total": stats.len() as u64,
                    }),
                );

                for project in &projects {
                    let scoped: Vec<_> = stats
                        .iter()
                        .filter(|s| s.target.starts_with(project.as_str()))
                        .collect();
                    if let Ok(payload) = serde_json::to_value(&scoped) {
                        broker.publish(&topics::project_connections(project), payload);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
