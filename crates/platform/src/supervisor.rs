//! Subscription supervisor: a keyed map of target -> subscription task.
//!
//! Starting is idempotent, stopping is graceful with a join ceiling, and
//! abnormal task exits are restarted with exponential backoff and jitter
//! up to a per-hour budget, after which the target is quarantined until
//! explicitly started again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ingest::IngestQueue;
use crate::subscription::{Command, LogSubscription, StateHandle, SubscriptionConfig};
use crate::types::{ConnectionStats, MonitoringTarget, SubscriptionStatus};
use crate::{PlatformError, PlatformResult};

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Restart budget per target per hour before quarantine.
    pub max_restarts_per_hour: u32,
    /// Ceiling on waiting for a stopping task to exit.
    pub stop_timeout: Duration,
    pub subscription: SubscriptionConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts_per_hour: 10,
            stop_timeout: Duration::from_secs(5),
            subscription: SubscriptionConfig::default(),
        }
    }
}

/// Live handles to the current subscription task instance. The monitor
/// refreshes these when it restarts a crashed task.
struct LiveHandles {
    commands: mpsc::Sender<Command>,
    state: StateHandle,
}

struct ManagedTarget {
    target: MonitoringTarget,
    live: Arc<Mutex<LiveHandles>>,
    monitor: JoinHandle<()>,
    stopping: Arc<AtomicBool>,
    quarantined: Arc<AtomicBool>,
}

impl ManagedTarget {
    fn commands(&self) -> mpsc::Sender<Command> {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .commands
            .clone()
    }

    fn state(&self) -> StateHandle {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .clone()
    }
}

/// Dynamic set of log subscriptions keyed by target.
pub struct SubscriptionSupervisor {
    targets: DashMap<String, ManagedTarget>,
    token: Option<String>,
    ingest: Arc<IngestQueue>,
    config: SupervisorConfig,
    shutdown: watch::Receiver<bool>,
}

impl SubscriptionSupervisor {
    #[must_use]
    pub fn new(
        token: Option<String>,
        ingest: Arc<IngestQueue>,
        config: SupervisorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            targets: DashMap::new(),
            token,
            ingest,
            config,
            shutdown,
        }
    }

    /// Shared ingest queue feeding the detector.
    #[must_use]
    pub fn ingest(&self) -> Arc<IngestQueue> {
        Arc::clone(&self.ingest)
    }

    /// Start a subscription for a target. Idempotent: a running target is
    /// left alone. Starting a quarantined target re-enables it.
    pub fn start(&self, target: &MonitoringTarget) -> PlatformResult<()> {
        let token = self.token.clone().ok_or(PlatformError::NotConfigured)?;
        let key = target.key();

        if let Some(existing) = self.targets.get(&key) {
            if !existing.monitor.is_finished() && !existing.quarantined.load(Ordering::SeqCst) {
                info!(target = %key, "Subscription already running");
                return Ok(());
            }
        }
        // A finished or quarantined entry is replaced by a fresh start.
        self.targets.remove(&key);

        let stopping = Arc::new(AtomicBool::new(false));
        let quarantined = Arc::new(AtomicBool::new(false));

        let (subscription, commands, state) = LogSubscription::new(
            target.clone(),
            token.clone(),
            self.config.subscription.clone(),
            Arc::clone(&self.ingest),
        );
        let live = Arc::new(Mutex::new(LiveHandles { commands, state }));

        let monitor = tokio::spawn(monitor_target(MonitorArgs {
            target: target.clone(),
            first: subscription,
            config: self.config.clone(),
            ingest: Arc::clone(&self.ingest),
            token,
            shutdown: self.shutdown.clone(),
            stopping: Arc::clone(&stopping),
            quarantined: Arc::clone(&quarantined),
            live: Arc::clone(&live),
        }));

        self.targets.insert(
            key.clone(),
            ManagedTarget {
                target: target.clone(),
                live,
                monitor,
                stopping,
                quarantined,
            },
        );

        info!(target = %key, "Subscription started");
        Ok(())
    }

    /// Stop a target's subscription. Idempotent; waits up to the stop
    /// timeout for the task to exit.
    pub async fn stop(&self, target: &MonitoringTarget) {
        let key = target.key();
        let Some((_, managed)) = self.targets.remove(&key) else {
            return;
        };

        managed.stopping.store(true, Ordering::SeqCst);
        let _ = managed.commands().send(Command::Stop).await;

        match tokio::time::timeout(self.config.stop_timeout, managed.monitor).await {
            Ok(_) => info!(target = %key, "Subscription stopped"),
            Err(_) => warn!(target = %key, "Subscription did not stop within the ceiling"),
        }
    }

    /// Stop then start; sequential per target.
    pub async fn restart(&self, target: &MonitoringTarget) -> PlatformResult<()> {
        self.stop(target).await;
        self.start(target)
    }

    /// Add an extra subscription on a running target. Replies with the
    /// subscription id.
    pub async fn subscribe_to_logs(
        &self,
        target: &MonitoringTarget,
        payload: Value,
    ) -> PlatformResult<String> {
        let key = target.key();
        let commands = {
            let entry = self
                .targets
                .get(&key)
                .ok_or_else(|| PlatformError::NotFound(format!("target {key}")))?;
            if entry.quarantined.load(Ordering::SeqCst) {
                return Err(PlatformError::Quarantined(key));
            }
            entry.commands()
        };

        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Subscribe { payload, reply })
            .await
            .map_err(|_| PlatformError::NotFound(format!("target {key} not running")))?;

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .map_err(|_| PlatformError::Timeout)?
            .map_err(|_| PlatformError::Transport("subscription task dropped reply".into()))
    }

    /// Remove a subscription id from a running target.
    pub async fn unsubscribe(&self, target: &MonitoringTarget, sub_id: &str) -> PlatformResult<()> {
        let key = target.key();
        let commands = self
            .targets
            .get(&key)
            .ok_or_else(|| PlatformError::NotFound(format!("target {key}")))?
            .commands();
        commands
            .send(Command::Unsubscribe {
                id: sub_id.to_string(),
            })
            .await
            .map_err(|_| PlatformError::NotFound(format!("target {key} not running")))
    }

    /// Snapshot of every managed target.
    #[must_use]
    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        self.targets
            .iter()
            .map(|entry| {
                let state = entry.state().snapshot();
                ConnectionStats {
                    target: entry.key().clone(),
                    alive: !entry.monitor.is_finished(),
                    connected: state.status == SubscriptionStatus::Connected,
                    connection_attempts: state.connection_attempts,
                    events_received: state.events_received,
                    events_dropped: self.ingest.dropped_count(),
                }
            })
            .collect()
    }

    /// Whether at least one subscription is currently connected.
    #[must_use]
    pub fn any_connected(&self) -> bool {
        self.targets.iter().any(|entry| {
            !entry.monitor.is_finished()
                && entry.state().snapshot().status == SubscriptionStatus::Connected
        })
    }

    /// Targets currently quarantined.
    #[must_use]
    pub fn quarantined_targets(&self) -> Vec<MonitoringTarget> {
        self.targets
            .iter()
            .filter(|entry| entry.quarantined.load(Ordering::SeqCst))
            .map(|entry| entry.target.clone())
            .collect()
    }

    /// Stop everything (process shutdown).
    pub async fn stop_all(&self) {
        let targets: Vec<MonitoringTarget> = self
            .targets
            .iter()
            .map(|entry| entry.target.clone())
            .collect();
        for target in targets {
            self.stop(&target).await;
        }
    }
}

struct MonitorArgs {
    target: MonitoringTarget,
    first: LogSubscription,
    config: SupervisorConfig,
    ingest: Arc<IngestQueue>,
    token: String,
    shutdown: watch::Receiver<bool>,
    stopping: Arc<AtomicBool>,
    quarantined: Arc<AtomicBool>,
    live: Arc<Mutex<LiveHandles>>,
}

/// Run a subscription task and restart it on abnormal exit.
///
/// The subscription handles connection errors itself (backoff inside the
/// state machine); this loop only deals with crashed tasks.
async fn monitor_target(args: MonitorArgs) {
    let MonitorArgs {
        target,
        first,
        config,
        ingest,
        token,
        shutdown,
        stopping,
        quarantined,
        live,
    } = args;

    let mut restarts: VecDeque<Instant> = VecDeque::new();
    let mut current = Some(first);

    loop {
        let subscription = current.take().unwrap_or_else(|| {
            let (subscription, commands, state) = LogSubscription::new(
                target.clone(),
                token.clone(),
                config.subscription.clone(),
                Arc::clone(&ingest),
            );
            let mut guard = live.lock().unwrap_or_else(|e| e.into_inner());
            guard.commands = commands;
            guard.state = state;
            subscription
        });

        let result = tokio::spawn(subscription.run(shutdown.clone())).await;

        if stopping.load(Ordering::SeqCst) || *shutdown.borrow() {
            return;
        }

        match result {
            Ok(()) => {
                // Exited without a stop request: command channel dropped or
                // an unrecoverable protocol failure. Treat like a crash.
                warn!(target = %target, "Subscription task exited unexpectedly");
            }
            Err(join_error) => {
                error!(target = %target, error = %join_error, "Subscription task crashed");
            }
        }

        let now = Instant::now();
        restarts.push_back(now);
        while let Some(oldest) = restarts.front() {
            if now.duration_since(*oldest) > Duration::from_secs(3600) {
                restarts.pop_front();
            } else {
                break;
            }
        }

        if restarts.len() as u32 >= config.max_restarts_per_hour {
            quarantined.store(true, Ordering::SeqCst);
            error!(
                target = %target,
                restarts = restarts.len(),
                "Restart budget exhausted; target quarantined"
            );
            return;
        }

        let backoff = crate::subscription::backoff_for_attempts(
            restarts.len() as u32,
            crate::subscription::BACKOFF_CEILING_MS,
        );
        let jitter = rand::thread_rng().gen_range(0..1_000);
        tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> MonitoringTarget {
        MonitoringTarget {
            project_id: "p-1".to_string(),
            environment_id: "env-1".to_string(),
            service_id: Some("svc-1".to_string()),
        }
    }

    #[tokio::test]
    async fn start_without_token_is_not_configured() {
        let (_tx, shutdown) = watch::channel(false);
        let supervisor = SubscriptionSupervisor::new(
            None,
            IngestQueue::new(16),
            SupervisorConfig::default(),
            shutdown,
        );
        assert!(matches!(
            supervisor.start(&target()),
            Err(PlatformError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_converges() {
        let (_tx, shutdown) = watch::channel(false);
        // Point at a local closed port so connects fail fast and no real
        // traffic leaves the test.
        let config = SupervisorConfig {
            stop_timeout: Duration::from_millis(200),
            subscription: SubscriptionConfig {
                ws_url: "ws://127.0.0.1:9".to_string(),
                ..SubscriptionConfig::default()
            },
            ..SupervisorConfig::default()
        };
        let supervisor = SubscriptionSupervisor::new(
            Some("tok".to_string()),
            IngestQueue::new(16),
            config,
            shutdown,
        );

        supervisor.start(&target()).unwrap();
        supervisor.start(&target()).unwrap();
        assert_eq!(supervisor.connection_stats().len(), 1);

        supervisor.stop(&target()).await;
        assert!(supervisor.connection_stats().is_empty());
        assert!(!supervisor.any_connected());

        // stop -> start converges to a fresh entry, as from cold.
        supervisor.start(&target()).unwrap();
        let stats = supervisor.connection_stats();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].alive);
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn stop_unknown_target_is_noop() {
        let (_tx, shutdown) = watch::channel(false);
        let supervisor = SubscriptionSupervisor::new(
            Some("tok".to_string()),
            IngestQueue::new(16),
            SupervisorConfig::default(),
            shutdown,
        );
        supervisor.stop(&target()).await;
    }
}
