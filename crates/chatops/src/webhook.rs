//! Slack webhook endpoints: `/interactive` and `/slash`.
//!
//! Both verify the request signature before trusting anything in the
//! body, and both answer fast: real work runs in spawned tasks so Slack's
//! 3-second response window is never at risk.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ai::{AiMessage, GenerateOptions, ProviderChoice, ProviderRegistry};
use broker::{topics, Broker};
use platform::RailwayClient;
use store::{Incident, IncidentStatus, Store};

use crate::notifier::SlackNotifier;
use crate::signature::{timestamp_is_fresh, verify_signature};

/// Deployment log lines fetched for the auto-fix refinement.
const AUTO_FIX_LOG_LINES: u32 = 50;

/// Shared dependencies for webhook dispatch and the conversation manager.
pub struct ChatDeps {
    pub store: Store,
    pub broker: Arc<Broker>,
    pub notifier: Arc<SlackNotifier>,
    pub platform: Arc<RailwayClient>,
    pub registry: Arc<ProviderRegistry>,
}

/// Webhook router state.
#[derive(Clone)]
pub struct WebhookState {
    pub signing_secret: Option<String>,
    pub deps: Arc<ChatDeps>,
}

/// Build the Slack webhook router.
pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/interactive", post(interactive_handler))
        .route("/slash", post(slash_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct InteractiveForm {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct InteractivePayload {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    actions: Vec<ActionItem>,
    #[serde(default)]
    user: Option<SlackUser>,
    #[serde(default)]
    channel: Option<SlackChannel>,
    #[serde(default)]
    message: Option<SlackMessage>,
}

#[derive(Debug, Deserialize)]
struct ActionItem {
    #[allow(dead_code)]
    action_id: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SlackChannel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    ts: String,
}

#[derive(Debug, Deserialize)]
struct SlashForm {
    command: String,
    #[serde(default)]
    text: String,
    user_id: String,
    channel_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    response_url: String,
}

/// A parsed interactive button value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRef {
    AutoFix(Uuid),
    Confirm(Uuid, String),
    Cancel(Uuid),
    StartChat(Uuid),
    Ignore(Uuid),
}

/// Parse `"<action>:<incident_id>"` / `"confirm:<id>:<action>"` values.
#[must_use]
pub fn parse_action_value(value: &str) -> Option<ActionRef> {
    let mut parts = value.splitn(3, ':');
    let action = parts.next()?;
    let id = Uuid::parse_str(parts.next()?).ok()?;

    match action {
        "auto_fix" => Some(ActionRef::AutoFix(id)),
        "confirm" => Some(ActionRef::Confirm(id, parts.next()?.to_string())),
        "cancel" | "cancel_auto_fix" => Some(ActionRef::Cancel(id)),
        "start_chat" => Some(ActionRef::StartChat(id)),
        "ignore" => Some(ActionRef::Ignore(id)),
        _ => None,
    }
}

fn verify(state: &WebhookState, headers: &HeaderMap, body: &[u8]) -> Result<(), StatusCode> {
    let Some(secret) = &state.signing_secret else {
        // No secret means the chat feature is degraded; never accept
        // unverified interactive traffic.
        warn!("Rejecting webhook: signing secret is not configured");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let timestamp = headers
        .get("x-slack-request-timestamp")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let signature = headers
        .get("x-slack-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !timestamp_is_fresh(timestamp, Utc::now().timestamp()) {
        warn!(timestamp = %timestamp, "Stale webhook timestamp");
        return Err(StatusCode::UNAUTHORIZED);
    }
    if !verify_signature(body, timestamp, signature, secret) {
        warn!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn interactive_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    verify(&state, &headers, &body)?;

    let form: InteractiveForm =
        serde_urlencoded::from_bytes(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let payload: InteractivePayload =
        serde_json::from_str(&form.payload).map_err(|_| StatusCode::BAD_REQUEST)?;

    if payload.kind != "block_actions" {
        debug!(kind = %payload.kind, "Ignoring non-block_actions payload");
        return Ok(StatusCode::OK);
    }

    let user_id = payload.user.map(|u| u.id).unwrap_or_default();
    let channel_id = payload.channel.map(|c| c.id).unwrap_or_default();
    let message_ts = payload.message.map(|m| m.ts);

    for action in payload.actions {
        let Some(parsed) = parse_action_value(&action.value) else {
            warn!(value = %action.value, "Unparseable action value");
            continue;
        };

        info!(action = ?parsed, user = %user_id, "Interactive action received");

        let deps = Arc::clone(&state.deps);
        let user_id = user_id.clone();
        let channel_id = channel_id.clone();
        let message_ts = message_ts.clone();
        // The 3s response window: dispatch out of line.
        tokio::spawn(async move {
            dispatch_action(&deps, parsed, &user_id, &channel_id, message_ts.as_deref()).await;
        });
    }

    Ok(StatusCode::OK)
}

async fn slash_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    verify(&state, &headers, &body)?;

    let form: SlashForm =
        serde_urlencoded::from_bytes(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    info!(command = %form.command, user = %form.user_id, "Slash command received");

    state.deps.broker.publish(
        topics::CONVERSATIONS_EVENTS,
        json!({
            "event": "slash",
            "command": form.command,
            "text": form.text,
            "user_id": form.user_id,
            "channel_id": form.channel_id,
        }),
    );

    Ok(Json(json!({
        "response_type": "ephemeral",
        "text": "Processing your request...",
    })))
}

/// The thread an incident's alert lives in, when one was recorded.
fn thread_of(incident: &Incident) -> Option<String> {
    incident
        .metadata
        .get("thread_ts")
        .and_then(Value::as_str)
        .map(str::to_string)
}

async fn dispatch_action(
    deps: &ChatDeps,
    action: ActionRef,
    user_id: &str,
    channel_id: &str,
    message_ts: Option<&str>,
) {
    let result = match action {
        ActionRef::AutoFix(id) => auto_fix_flow(deps, id).await,
        ActionRef::Confirm(id, action_type) => {
            deps.broker.publish(
                topics::REMEDIATION_ACTIONS,
                json!({
                    "event": "auto_fix_requested",
                    "incident_id": id.to_string(),
                    "initiator": "user",
                    "initiator_ref": user_id,
                    "action_type": action_type,
                }),
            );
            reply(deps, id, ":hourglass: Remediation confirmed, starting...").await
        }
        ActionRef::Cancel(id) => reply(deps, id, "Auto-fix cancelled.").await,
        ActionRef::StartChat(id) => {
            deps.broker.publish(
                topics::CONVERSATIONS_EVENTS,
                json!({
                    "event": "start_chat",
                    "incident_id": id.to_string(),
                    "channel_id": channel_id,
                    "user_id": user_id,
                    "thread_ts": message_ts,
                }),
            );
            Ok(())
        }
        ActionRef::Ignore(id) => ignore_flow(deps, id).await,
    };

    if let Err(e) = result {
        warn!(error = %e, "Interactive action dispatch failed");
    }
}

async fn reply(deps: &ChatDeps, incident_id: Uuid, text: &str) -> crate::ChatResult<()> {
    let incident = deps.store.incident(incident_id).await?;
    match thread_of(&incident) {
        Some(ts) => deps.notifier.post_thread_reply(&ts, text).await?,
        None => deps.notifier.post_channel_message(text).await?,
    };
    Ok(())
}

/// Auto-Fix press: refine the recommendation with recent deployment logs,
/// then ask for confirmation.
async fn auto_fix_flow(deps: &ChatDeps, incident_id: Uuid) -> crate::ChatResult<()> {
    let incident = deps.store.incident(incident_id).await?;

    if incident.status.is_terminal() {
        return reply(deps, incident_id, "This incident is already resolved.").await;
    }

    let log_tail = fetch_recent_logs(deps, &incident).await;
    let refined = refine_recommendation(deps, &incident, &log_tail).await;

    let thread_ts = thread_of(&incident).unwrap_or_default();
    if thread_ts.is_empty() {
        deps.notifier
            .post_channel_message(&format!(
                "Confirm remediation for {}: {}",
                incident.service_name, refined
            ))
            .await?;
    } else {
        deps.notifier
            .send_confirmation(&incident, &thread_ts, &refined)
            .await?;
    }
    Ok(())
}

async fn fetch_recent_logs(deps: &ChatDeps, incident: &Incident) -> Vec<String> {
    let Some(environment_id) = &incident.environment_id else {
        return Vec::new();
    };

    let deployment = deps
        .platform
        .latest_deployment_id("", environment_id, &incident.service_id)
        .await;
    match deployment {
        Ok(deployment_id) => deps
            .platform
            .deployment_logs(&deployment_id, AUTO_FIX_LOG_LINES)
            .await
            .unwrap_or_default(),
        Err(e) => {
            debug!(error = %e, "No deployment logs for auto-fix refinement");
            Vec::new()
        }
    }
}

async fn refine_recommendation(
    deps: &ChatDeps,
    incident: &Incident,
    log_tail: &[String],
) -> String {
    let default_summary = format!(
        "Recommended action: `{}` (confidence {:.0}%).",
        incident.recommended_action.as_str(),
        incident.confidence * 100.0
    );

    let Ok(provider) = deps.registry.select(ProviderChoice::Auto) else {
        return default_summary;
    };

    let mut prompt = format!(
        "Incident on service {}: {}\nProposed action: {}\n",
        incident.service_name,
        incident.root_cause.as_deref().unwrap_or("cause unknown"),
        incident.recommended_action.as_str(),
    );
    if !log_tail.is_empty() {
        prompt.push_str("Recent deployment logs:\n");
        for line in log_tail.iter().take(AUTO_FIX_LOG_LINES as usize) {
            prompt.push_str(line);
            prompt.push('\n');
        }
    }
    prompt.push_str(
        "In two sentences: does the proposed action still look right, and what should the operator expect?",
    );

    let messages = vec![
        AiMessage::system("You are an SRE assistant confirming a remediation plan."),
        AiMessage::user(prompt),
    ];
    let options = GenerateOptions {
        temperature: Some(0.2),
        max_tokens: Some(256),
    };

    match provider.generate(&messages, &options).await {
        Ok(response) if !response.text.trim().is_empty() => response.text.trim().to_string(),
        _ => default_summary,
    }
}

async fn ignore_flow(deps: &ChatDeps, incident_id: Uuid) -> crate::ChatResult<()> {
    let incident = deps.store.incident(incident_id).await?;

    match deps
        .store
        .transition_incident(incident_id, IncidentStatus::Ignored)
        .await
    {
        Ok(updated) => {
            deps.broker.publish(
                topics::TELEMETRY_EVENTS,
                json!({ "event": "incident_ignored", "service_id": updated.service_id }),
            );
            reply(
                deps,
                incident_id,
                &format!(
                    ":no_bell: Incident on {} ignored by an operator.",
                    updated.service_name
                ),
            )
            .await
        }
        Err(store::StoreError::InvalidTransition { from, .. }) => {
            reply(
                deps,
                incident_id,
                &format!("Cannot ignore: incident is already `{from}`."),
            )
            .await
        }
        Err(e) => {
            warn!(incident_id = %incident.id, error = %e, "Ignore transition failed");
            Err(e.into())
        }
    }
}
