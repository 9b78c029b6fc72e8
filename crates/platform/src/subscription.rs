//! Per-target log stream subscription.
//!
//! One task owns one graphql-transport-ws connection and its state
//! machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> (frames...)
//!       ^             |            |
//!       |             v            v
//!       +-- backoff - Error <- heartbeat timeout
//! ```
//!
//! Inbound log frames are normalized and pushed onto the shared ingest
//! queue; the reader never blocks on downstream consumers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::frames::{ClientFrame, ServerFrame};
use crate::ingest::IngestQueue;
use crate::types::{
    LogEvent, LogLevel, MonitoringTarget, SubscriptionState, SubscriptionStatus,
    MAX_MESSAGE_CHARS,
};

/// Default subscription endpoint.
pub const RAILWAY_WS_URL: &str = "wss://backboard.railway.com/graphql/v2";

/// Backoff floor and ceiling in milliseconds.
pub const BACKOFF_FLOOR_MS: u64 = 5_000;
pub const BACKOFF_CEILING_MS: u64 = 60_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tunables for one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub ws_url: String,
    pub connection_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Log filter for the default subscription.
    pub log_filter: String,
    pub max_backoff_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            ws_url: RAILWAY_WS_URL.to_string(),
            connection_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(45),
            log_filter: "level:error".to_string(),
            max_backoff_ms: BACKOFF_CEILING_MS,
        }
    }
}

/// Commands accepted by a running subscription.
#[derive(Debug)]
pub enum Command {
    /// Add a subscription; replies with its id.
    Subscribe {
        payload: Value,
        reply: oneshot::Sender<String>,
    },
    /// Remove a subscription by id.
    Unsubscribe { id: String },
    /// Graceful stop: complete frames, close, no backoff reschedule.
    Stop,
}

/// How one connect-serve cycle ended.
enum ServeExit {
    Stopped,
    Shutdown,
    Failed(String),
}

/// Exponential backoff: `5000 * 2^(attempts-1)` clamped to
/// `[5000, max_ms]`.
#[must_use]
pub fn backoff_for_attempts(attempts: u32, max_ms: u64) -> u64 {
    let exponent = attempts.saturating_sub(1).min(10);
    let ceiling = max_ms.max(BACKOFF_FLOOR_MS);
    (BACKOFF_FLOOR_MS.saturating_mul(1u64 << exponent)).clamp(BACKOFF_FLOOR_MS, ceiling)
}

/// Shared, read-only view of a subscription's state.
#[derive(Clone)]
pub struct StateHandle(Arc<RwLock<SubscriptionState>>);

impl StateHandle {
    fn new() -> Self {
        Self(Arc::new(RwLock::new(SubscriptionState::default())))
    }

    /// Take a snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> SubscriptionState {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update(&self, f: impl FnOnce(&mut SubscriptionState)) {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }
}

/// One long-lived log subscription.
pub struct LogSubscription {
    target: MonitoringTarget,
    token: String,
    config: SubscriptionConfig,
    ingest: Arc<IngestQueue>,
    state: StateHandle,
    commands: mpsc::Receiver<Command>,
    /// Active subscription payloads by id, re-issued after reconnect.
    subscriptions: HashMap<String, Value>,
    next_sub_id: u64,
}

impl LogSubscription {
    /// Build a subscription and its command/state handles.
    #[must_use]
    pub fn new(
        target: MonitoringTarget,
        token: String,
        config: SubscriptionConfig,
        ingest: Arc<IngestQueue>,
    ) -> (Self, mpsc::Sender<Command>, StateHandle) {
        let (tx, rx) = mpsc::channel(16);
        let state = StateHandle::new();

        let mut subscription = Self {
            target,
            token,
            config,
            ingest,
            state: state.clone(),
            commands: rx,
            subscriptions: HashMap::new(),
            next_sub_id: 0,
        };

        // Every target starts with its default log subscription.
        let payload = default_subscription_payload(
            &subscription.target,
            &subscription.config.log_filter,
        );
        subscription.add_subscription(payload);

        (subscription, tx, state)
    }

    fn add_subscription(&mut self, payload: Value) -> String {
        self.next_sub_id += 1;
        let id = self.next_sub_id.to_string();
        self.subscriptions.insert(id.clone(), payload);
        let count = self.subscriptions.len();
        self.state.update(|s| s.active_subscriptions = count);
        id
    }

    fn remove_subscription(&mut self, id: &str) {
        self.subscriptions.remove(id);
        let count = self.subscriptions.len();
        self.state.update(|s| s.active_subscriptions = count);
    }

    /// Drive the state machine until stopped or shut down.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(target = %self.target, "Log subscription starting");

        loop {
            if *shutdown.borrow() {
                self.state.update(|s| s.status = SubscriptionStatus::Disconnected);
                return;
            }

            self.state.update(|s| {
                s.status = SubscriptionStatus::Connecting;
                s.connection_attempts += 1;
            });

            match self.connect_and_serve(&mut shutdown).await {
                ServeExit::Stopped | ServeExit::Shutdown => {
                    self.state
                        .update(|s| s.status = SubscriptionStatus::Disconnected);
                    info!(target = %self.target, "Log subscription stopped");
                    return;
                }
                ServeExit::Failed(reason) => {
                    let attempts = self.state.snapshot().connection_attempts;
                    let backoff = backoff_for_attempts(attempts, self.config.max_backoff_ms);
                    self.state.update(|s| {
                        s.status = SubscriptionStatus::Error;
                        s.last_error = Some(reason.clone());
                        s.backoff_ms = backoff;
                    });
                    warn!(
                        target = %self.target,
                        attempts,
                        backoff_ms = backoff,
                        error = %reason,
                        "Subscription error, scheduling reconnect"
                    );

                    if !self.wait_backoff(backoff, &mut shutdown).await {
                        self.state
                            .update(|s| s.status = SubscriptionStatus::Disconnected);
                        return;
                    }
                }
            }
        }
    }

    /// Sleep the backoff window, still servicing commands. Returns `false`
    /// when stop/shutdown arrived during the wait.
    async fn wait_backoff(&mut self, backoff_ms: u64, shutdown: &mut watch::Receiver<bool>) -> bool {
        let deadline = tokio::time::sleep(Duration::from_millis(backoff_ms));
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => return true,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe { payload, reply }) => {
                        let id = self.add_subscription(payload);
                        let _ = reply.send(id);
                    }
                    Some(Command::Unsubscribe { id }) => self.remove_subscription(&id),
                    Some(Command::Stop) | None => return false,
                },
            }
        }
    }

    async fn connect_and_serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> ServeExit {
        // Token travels both as a URL parameter and in the init payload.
        let url = format!("{}?token={}", self.config.ws_url, self.token);
        let mut request = match url.into_client_request() {
            Ok(request) => request,
            Err(e) => return ServeExit::Failed(format!("bad websocket url: {e}")),
        };
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("graphql-transport-ws"),
        );

        let connect = tokio::time::timeout(self.config.connection_timeout, connect_async(request));
        let ws: WsStream = match connect.await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return ServeExit::Failed(format!("connect failed: {e}")),
            Err(_) => return ServeExit::Failed("connect timed out".to_string()),
        };

        let (mut sink, mut stream) = ws.split();

        let init = ClientFrame::ConnectionInit {
            payload: json!({ "Authorization": format!("Bearer {}", self.token) }),
        };
        if let Err(e) = sink.send(Message::Text(init.to_text())).await {
            return ServeExit::Failed(format!("connection_init send failed: {e}"));
        }

        // Handshake: wait for connection_ack within the connection timeout.
        let handshake_deadline = Instant::now() + self.config.connection_timeout;
        loop {
            let remaining = handshake_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return ServeExit::Failed("handshake timed out".to_string());
            }

            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    match ServerFrame::parse(&text) {
                        Some(ServerFrame::ConnectionAck { .. }) => break,
                        Some(ServerFrame::Ping { payload }) => {
                            let pong = ClientFrame::Pong { payload };
                            if sink.send(Message::Text(pong.to_text())).await.is_err() {
                                return ServeExit::Failed("pong send failed".to_string());
                            }
                        }
                        // Anything else before the ack is ignored.
                        _ => {}
                    }
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    return ServeExit::Failed(format!("handshake read failed: {e}"))
                }
                Ok(None) => return ServeExit::Failed("closed during handshake".to_string()),
                Err(_) => return ServeExit::Failed("handshake timed out".to_string()),
            }
        }

        // Acknowledged: reset the failure accounting and re-issue every
        // known subscription.
        self.state.update(|s| {
            s.status = SubscriptionStatus::Connected;
            s.connection_attempts = 0;
            s.backoff_ms = BACKOFF_FLOOR_MS;
            s.last_heartbeat = Some(Utc::now());
            s.last_error = None;
        });
        info!(target = %self.target, "Subscription connected");

        for (id, payload) in &self.subscriptions {
            let frame = ClientFrame::Subscribe {
                id: id.clone(),
                payload: payload.clone(),
            };
            if let Err(e) = sink.send(Message::Text(frame.to_text())).await {
                return ServeExit::Failed(format!("subscribe send failed: {e}"));
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset();

        // Any inbound frame pushes the idle deadline out; reaching it means
        // the peer has been silent for the full heartbeat timeout.
        let idle_deadline = tokio::time::sleep(self.config.heartbeat_timeout);
        tokio::pin!(idle_deadline);

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        idle_deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.config.heartbeat_timeout);
                        self.state.update(|s| s.last_heartbeat = Some(Utc::now()));
                        if let Some(exit) = self.handle_frame(&text, &mut sink).await {
                            return exit;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        idle_deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.config.heartbeat_timeout);
                        self.state.update(|s| s.last_heartbeat = Some(Utc::now()));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return ServeExit::Failed("peer closed the stream".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return ServeExit::Failed(format!("read failed: {e}")),
                },

                () = &mut idle_deadline => {
                    return ServeExit::Failed("heartbeat timed out".to_string());
                }

                _ = heartbeat.tick() => {
                    let ping = ClientFrame::Ping { payload: None };
                    if sink.send(Message::Text(ping.to_text())).await.is_err() {
                        return ServeExit::Failed("ping send failed".to_string());
                    }
                }

                command = self.commands.recv() => match command {
                    Some(Command::Subscribe { payload, reply }) => {
                        let id = self.add_subscription(payload.clone());
                        let frame = ClientFrame::Subscribe { id: id.clone(), payload };
                        let _ = reply.send(id);
                        if sink.send(Message::Text(frame.to_text())).await.is_err() {
                            return ServeExit::Failed("subscribe send failed".to_string());
                        }
                    }
                    Some(Command::Unsubscribe { id }) => {
                        self.remove_subscription(&id);
                        let frame = ClientFrame::Complete { id };
                        let _ = sink.send(Message::Text(frame.to_text())).await;
                    }
                    Some(Command::Stop) | None => {
                        self.graceful_close(&mut sink).await;
                        return ServeExit::Stopped;
                    }
                },

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.graceful_close(&mut sink).await;
                        return ServeExit::Shutdown;
                    }
                }
            }
        }
    }

    /// Handle one text frame; `Some(exit)` terminates the connection.
    async fn handle_frame(
        &mut self,
        text: &str,
        sink: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
                  + Unpin),
    ) -> Option<ServeExit> {
        match ServerFrame::parse(text) {
            Some(ServerFrame::Next { id: _, payload } | ServerFrame::Data { id: _, payload }) => {
                self.ingest_payload(&payload);
                None
            }
            Some(ServerFrame::Ping { payload }) => {
                let pong = ClientFrame::Pong { payload };
                if sink.send(Message::Text(pong.to_text())).await.is_err() {
                    return Some(ServeExit::Failed("pong send failed".to_string()));
                }
                None
            }
            Some(ServerFrame::Error { id, payload }) => {
                // The subscription is dead server-side; the transport stays
                // open for the others.
                warn!(target = %self.target, sub_id = %id, error = %payload, "Subscription errored");
                self.remove_subscription(&id);
                self.state
                    .update(|s| s.last_error = Some(format!("subscription {id}: {payload}")));
                None
            }
            Some(ServerFrame::Complete { id }) => {
                debug!(target = %self.target, sub_id = %id, "Subscription completed by server");
                self.remove_subscription(&id);
                None
            }
            Some(
                ServerFrame::ConnectionAck { .. } | ServerFrame::Pong { .. } | ServerFrame::Unknown,
            )
            | None => None,
        }
    }

    /// Pull log entries out of a `next` payload and push them downstream.
    fn ingest_payload(&self, payload: &Value) {
        let entries = ["environmentLogs", "deploymentLogs"]
            .iter()
            .find_map(|key| payload.pointer(&format!("/data/{key}")));

        let Some(entries) = entries else {
            return;
        };

        let mut count = 0u64;
        match entries {
            Value::Array(list) => {
                for entry in list {
                    if let Some(event) = normalize_log_entry(entry, &self.target) {
                        self.ingest.push(event);
                        count += 1;
                    }
                }
            }
            entry @ Value::Object(_) => {
                if let Some(event) = normalize_log_entry(entry, &self.target) {
                    self.ingest.push(event);
                    count += 1;
                }
            }
            _ => {}
        }

        if count > 0 {
            self.state.update(|s| s.events_received += count);
        }
    }

    async fn graceful_close(
        &mut self,
        sink: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
                  + Unpin),
    ) {
        for id in self.subscriptions.keys() {
            let frame = ClientFrame::Complete { id: id.clone() };
            let _ = sink.send(Message::Text(frame.to_text())).await;
        }
        let _ = sink.send(Message::Close(None)).await;
    }
}

/// The default `environmentLogs` subscription payload for a target.
#[must_use]
pub fn default_subscription_payload(target: &MonitoringTarget, log_filter: &str) -> Value {
    let filter = match &target.service_id {
        Some(service_id) => format!("service:{service_id} {log_filter}"),
        None => log_filter.to_string(),
    };

    json!({
        "query": "subscription environmentLogs($environmentId: String!, $filter: String!) { \
                  environmentLogs(environmentId: $environmentId, filter: $filter) { \
                  timestamp severity message tags { serviceId serviceName } } }",
        "variables": {
            "environmentId": target.environment_id,
            "filter": filter,
        },
    })
}

/// Normalize a raw log entry into a [`LogEvent`].
///
/// Entries without a message are discarded; everything else is clamped
/// into shape rather than dropped.
#[must_use]
pub fn normalize_log_entry(entry: &Value, target: &MonitoringTarget) -> Option<LogEvent> {
    let message = entry.get("message").and_then(Value::as_str)?;
    let mut message = message.to_string();
    if message.chars().count() > MAX_MESSAGE_CHARS {
        message = message.chars().take(MAX_MESSAGE_CHARS).collect();
    }

    let timestamp = entry
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

    let level = entry
        .get("severity")
        .and_then(Value::as_str)
        .map_or(LogLevel::Info, LogLevel::clamp);

    let service_id = entry
        .pointer("/tags/serviceId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| target.service_id.clone())
        .unwrap_or_else(|| format!("env:{}", target.environment_id));

    let service_name = entry
        .pointer("/tags/serviceName")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut raw_metadata = HashMap::new();
    if let Some(map) = entry.as_object() {
        for (key, value) in map {
            if key != "message" {
                raw_metadata.insert(key.clone(), value.clone());
            }
        }
    }

    Some(LogEvent {
        service_id,
        environment_id: Some(target.environment_id.clone()),
        service_name,
        timestamp,
        level,
        severity_score: level.score(),
        message,
        raw_metadata,
        source: Some("railway".to_string()),
    })
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

    #[test]
    fn backoff_is_monotone_and_bounded() {
        let mut previous = 0;
        for attempts in 1..=12 {
            let backoff = backoff_for_attempts(attempts, BACKOFF_CEILING_MS);
            assert!(backoff >= BACKOFF_FLOOR_MS);
            assert!(backoff <= BACKOFF_CEILING_MS);
            assert!(backoff >= previous);
            previous = backoff;
        }
        assert_eq!(backoff_for_attempts(1, BACKOFF_CEILING_MS), 5_000);
        assert_eq!(backoff_for_attempts(2, BACKOFF_CEILING_MS), 10_000);
        assert_eq!(backoff_for_attempts(5, BACKOFF_CEILING_MS), 60_000);
        assert_eq!(backoff_for_attempts(50, BACKOFF_CEILING_MS), 60_000);
    }

    #[test]
    fn normalization_fills_defaults() {
        let entry = json!({
            "message": "ERROR: db connection refused",
            "severity": "ERROR",
            "timestamp": "2026-03-01T12:00:00Z",
        });
        let event = normalize_log_entry(&entry, &target()).unwrap();

        assert_eq!(event.service_id, "svc-1");
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.severity_score, 4);
        assert_eq!(event.environment_id.as_deref(), Some("env-1"));
    }

    #[test]
    fn normalization_prefers_entry_tags() {
        let entry = json!({
            "message": "oom",
            "severity": "fatal",
            "tags": { "serviceId": "svc-9", "serviceName": "worker" },
        });
        let event = normalize_log_entry(&entry, &target()).unwrap();
        assert_eq!(event.service_id, "svc-9");
        assert_eq!(event.service_name.as_deref(), Some("worker"));
        assert_eq!(event.level, LogLevel::Fatal);
    }

    #[test]
    fn normalization_clamps_unknown_level_and_bad_timestamp() {
        let entry = json!({
            "message": "hello",
            "severity": "verbose",
            "timestamp": "not-a-date",
        });
        let event = normalize_log_entry(&entry, &target()).unwrap();
        assert_eq!(event.level, LogLevel::Info);
        // Fallback timestamp is "now"; just confirm it parsed to something
        // recent rather than the epoch.
        assert!(Utc::now().signed_duration_since(event.timestamp).num_seconds() < 5);
    }

    #[test]
    fn normalization_truncates_long_messages() {
        let long = "x".repeat(MAX_MESSAGE_CHARS + 100);
        let entry = json!({ "message": long, "severity": "error" });
        let event = normalize_log_entry(&entry, &target()).unwrap();
        assert_eq!(event.message.chars().count(), MAX_MESSAGE_CHARS);
    }

    #[test]
    fn normalization_skips_messageless_entries() {
        let entry = json!({ "severity": "error" });
        assert!(normalize_log_entry(&entry, &target()).is_none());
    }

    #[test]
    fn env_wide_target_filter() {
        let env_target = MonitoringTarget {
            project_id: "p-1".to_string(),
            environment_id: "env-1".to_string(),
            service_id: None,
        };
        let payload = default_subscription_payload(&env_target, "level:error");
        assert_eq!(payload["variables"]["filter"], "level:error");

        let scoped = default_subscription_payload(&target(), "level:warn");
        assert_eq!(scoped["variables"]["filter"], "service:svc-1 level:warn");
    }
}
