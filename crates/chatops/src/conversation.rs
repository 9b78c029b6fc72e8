//! Conversation manager: per-thread chat sessions over incidents.
//!
//! Listens on the `conversations:events` topic for `start_chat` button
//! presses, slash commands, and thread messages; persists every message;
//! answers read intents from the platform API and turns mutating intents
//! into `auto_fix_requested` emissions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ai::{AiMessage, GenerateOptions, ProviderChoice};
use broker::topics;
use store::{ConversationSession, Incident, IncidentStatus, MessageRole};

use crate::intent::{parse_intent, Intent};
use crate::webhook::ChatDeps;
use crate::{ChatError, ChatResult};

/// Sessions idle longer than this are closed by the sweep.
pub const IDLE_TIMEOUT_MINUTES: i64 = 60;

/// How often the idle sweep runs.
const SWEEP_INTERVAL_SECS: u64 = 300;

const HELP_TEXT: &str = "I can help with: `status`, `logs`, `deployments`, \
`restart`, `redeploy`, `stop`, `scale memory <mb>`, `scale replicas <n>`, \
`rollback`, `resolve`, `help`.";

/// Per-thread chat session manager.
pub struct ConversationManager {
    deps: Arc<ChatDeps>,
    /// Project scope for deployment listings.
    project_id: Option<String>,
}

impl ConversationManager {
    #[must_use]
    pub fn new(deps: Arc<ChatDeps>, project_id: Option<String>) -> Self {
        Self { deps, project_id }
    }

    /// Consume conversation events until shutdown. Also owns the idle
    /// sweep.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.deps.broker.subscribe(topics::CONVERSATIONS_EVENTS);
        let mut sweep = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Conversation manager starting");
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { return };
                    if let Err(e) = self.handle_event(&event).await {
                        warn!(error = %e, "Conversation event failed");
                    }
                }
                _ = sweep.tick() => {
                    match self
                        .deps
                        .store
                        .close_idle_sessions(ChronoDuration::minutes(IDLE_TIMEOUT_MINUTES))
                        .await
                    {
                        Ok(closed) if !closed.is_empty() => {
                            info!(count = closed.len(), "Closed idle conversation sessions");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Idle session sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Conversation manager stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: &Value) -> ChatResult<()> {
        match event.get("event").and_then(Value::as_str) {
            Some("start_chat") => self.handle_start_chat(event).await,
            Some("slash") => self.handle_slash(event).await,
            Some("message") => self.handle_thread_message(event).await,
            other => {
                debug!(event = ?other, "Ignoring unhandled conversation event");
                Ok(())
            }
        }
    }

    async fn handle_start_chat(&self, event: &Value) -> ChatResult<()> {
        let incident_id = field(event, "incident_id")?
            .parse::<Uuid>()
            .map_err(|e| ChatError::MalformedPayload(format!("incident_id: {e}")))?;
        let channel_id = field(event, "channel_id")?;
        let user_id = field(event, "user_id")?;
        let thread_ts = event
            .get("thread_ts")
            .and_then(Value::as_str)
            .unwrap_or("new");

        let channel_ref = format!("{channel_id}:{thread_ts}");
        let session = self
            .deps
            .store
            .find_or_create_session("chat", &channel_ref, &user_id, Some(incident_id))
            .await?;

        // Re-opening an existing thread is a no-op greeting.
        let messages = self.deps.store.messages(session.id).await?;
        if messages.is_empty() {
            self.deps
                .store
                .append_message(session.id, MessageRole::System, "Chat session started", None)
                .await?;

            let incident = self.deps.store.incident(incident_id).await?;
            let greeting = format!(
                "Chat session started for the incident on *{}*. {HELP_TEXT}",
                incident.service_name
            );
            self.post(&session, &greeting).await;
        }

        info!(session_id = %session.id, incident_id = %incident_id, "Chat session ready");
        Ok(())
    }

    async fn handle_slash(&self, event: &Value) -> ChatResult<()> {
        let channel_id = field(event, "channel_id")?;
        let user_id = field(event, "user_id")?;
        let text = event.get("text").and_then(Value::as_str).unwrap_or_default();

        let channel_ref = format!("{channel_id}:slash:{user_id}");
        let session = self
            .deps
            .store
            .find_or_create_session("chat", &channel_ref, &user_id, None)
            .await?;

        self.converse(&session, &user_id, text).await
    }

    async fn handle_thread_message(&self, event: &Value) -> ChatResult<()> {
        let channel_id = field(event, "channel_id")?;
        let user_id = field(event, "user_id")?;
        let thread_ts = field(event, "thread_ts")?;
        let text = event.get("text").and_then(Value::as_str).unwrap_or_default();

        let channel_ref = format!("{channel_id}:{thread_ts}");
        let session = self
            .deps
            .store
            .find_or_create_session("chat", &channel_ref, &user_id, None)
            .await?;

        self.converse(&session, &user_id, text).await
    }

    /// Persist the inbound message, act on the intent, persist and post
    /// the reply.
    async fn converse(&self, session: &ConversationSession, user_id: &str, text: &str) -> ChatResult<()> {
        self.deps
            .store
            .append_message(session.id, MessageRole::User, text, None)
            .await?;

        let incident = match session.incident_id {
            Some(id) => self.deps.store.incident(id).await.ok(),
            None => None,
        };

        let intent = parse_intent(text);
        debug!(session_id = %session.id, intent = ?intent, "Parsed intent");

        let reply = match &intent {
            Intent::Status => self.answer_status(incident.as_ref()).await,
            Intent::Logs => self.answer_logs(incident.as_ref()).await,
            Intent::Deployments => self.answer_deployments(incident.as_ref()).await,
            Intent::Help => HELP_TEXT.to_string(),
            Intent::Resolve => self.resolve(session, incident.as_ref()).await,
            Intent::Unknown => self.llm_reply(session, text).await,
            mutating => self.request_remediation(incident.as_ref(), mutating, user_id),
        };

        self.deps
            .store
            .append_message(session.id, MessageRole::Assistant, &reply, None)
            .await?;
        self.post(session, &reply).await;

        self.deps.broker.publish(
            topics::TELEMETRY_EVENTS,
            json!({ "event": "conversation_reply", "session_id": session.id.to_string() }),
        );
        Ok(())
    }

    async fn answer_status(&self, incident: Option<&Incident>) -> String {
        match incident {
            Some(incident) => format!(
                "Incident on *{}*: status `{}`, severity `{}`, confidence {:.0}%.\nRoot cause: {}",
                incident.service_name,
                incident.status.as_str(),
                incident.severity.as_str(),
                incident.confidence * 100.0,
                incident.root_cause.as_deref().unwrap_or("unknown"),
            ),
            None => match self.deps.store.open_incidents().await {
                Ok(open) if open.is_empty() => "No open incidents.".to_string(),
                Ok(open) => {
                    let mut lines = vec![format!("{} open incident(s):", open.len())];
                    for incident in open.iter().take(5) {
                        lines.push(format!(
                            "• {} `{}` ({})",
                            incident.service_name,
                            incident.severity.as_str(),
                            incident.status.as_str()
                        ));
                    }
                    lines.join("\n")
                }
                Err(_) => "Could not read incident state.".to_string(),
            },
        }
    }

    async fn answer_logs(&self, incident: Option<&Incident>) -> String {
        let Some(incident) = incident else {
            return "No incident is attached to this chat; `logs` needs one.".to_string();
        };
        let Some(environment_id) = &incident.environment_id else {
            return "The incident has no environment recorded.".to_string();
        };

        let deployment = match self
            .deps
            .platform
            .latest_deployment_id(
                self.project_id.as_deref().unwrap_or_default(),
                environment_id,
                &incident.service_id,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => return format!("Could not resolve the latest deployment: {e}"),
        };

        match self.deps.platform.deployment_logs(&deployment, 20).await {
            Ok(lines) if lines.is_empty() => "No recent log lines.".to_string(),
            Ok(lines) => format!("```{}```", lines.join("\n")),
            Err(e) => format!("Log fetch failed: {e}"),
        }
    }

    async fn answer_deployments(&self, incident: Option<&Incident>) -> String {
        let (Some(incident), Some(project_id)) = (incident, self.project_id.as_deref()) else {
            return "Deployment listing needs an incident-scoped chat.".to_string();
        };
        let Some(environment_id) = &incident.environment_id else {
            return "The incident has no environment recorded.".to_string();
        };

        match self
            .deps
            .platform
            .deployments(project_id, environment_id, &incident.service_id, 5)
            .await
        {
            Ok(deployments) if deployments.is_empty() => "No deployments found.".to_string(),
            Ok(deployments) => {
                let mut lines = vec!["Recent deployments:".to_string()];
                for deployment in deployments {
                    lines.push(format!(
                        "• `{}` {} ({})",
                        deployment.id,
                        deployment.status,
                        deployment.created_at.format("%Y-%m-%d %H:%M")
                    ));
                }
                lines.join("\n")
            }
            Err(e) => format!("Deployment listing failed: {e}"),
        }
    }

    async fn resolve(&self, session: &ConversationSession, incident: Option<&Incident>) -> String {
        if let Some(incident) = incident {
            match self
                .deps
                .store
                .transition_incident(incident.id, IncidentStatus::ManualResolved)
                .await
            {
                Ok(_) => {}
                Err(e) => return format!("Could not resolve the incident: {e}"),
            }
        }
        if let Err(e) = self.deps.store.close_session(session.id).await {
            warn!(session_id = %session.id, error = %e, "Session close failed");
        }
        "Marked resolved. Closing this session; ping me again any time.".to_string()
    }

    fn request_remediation(
        &self,
        incident: Option<&Incident>,
        intent: &Intent,
        user_id: &str,
    ) -> String {
        let Some(incident) = incident else {
            return "This chat has no incident attached; mutating commands need one.".to_string();
        };

        let (action_type, parameters) = match intent {
            Intent::Restart => ("restart", json!({})),
            Intent::Redeploy => ("redeploy", json!({})),
            Intent::Stop => ("stop", json!({})),
            Intent::Rollback => ("rollback", json!({})),
            Intent::ScaleMemory(mb) => ("scale_memory", json!({ "memory_mb": mb })),
            Intent::ScaleReplicas(n) => ("scale_replicas", json!({ "num_replicas": n })),
            _ => return HELP_TEXT.to_string(),
        };

        self.deps.broker.publish(
            topics::REMEDIATION_ACTIONS,
            json!({
                "event": "auto_fix_requested",
                "incident_id": incident.id.to_string(),
                "initiator": "user",
                "initiator_ref": user_id,
                "action_type": action_type,
                "parameters": parameters,
            }),
        );

        format!(
            ":hourglass: Requested `{action_type}` for *{}*; I'll post updates here.",
            incident.service_name
        )
    }

    /// Free-form fallback: let the model answer with the session history
    /// as context.
    async fn llm_reply(&self, session: &ConversationSession, _text: &str) -> String {
        let Ok(provider) = self.deps.registry.select(ProviderChoice::Auto) else {
            return HELP_TEXT.to_string();
        };

        let history = match self.deps.store.messages(session.id).await {
            Ok(history) => history,
            Err(_) => return HELP_TEXT.to_string(),
        };

        let mut messages = vec![AiMessage::system(
            "You are railguard, an incident-response assistant in a Slack thread. \
             Be brief and operational. If the user wants an action taken, tell them \
             the exact command to type (restart, rollback, scale memory <mb>, ...).",
        )];
        for message in history.iter().rev().take(12).rev() {
            match message.role {
                MessageRole::User => messages.push(AiMessage::user(message.content.clone())),
                MessageRole::Assistant => {
                    messages.push(AiMessage::assistant(message.content.clone()));
                }
                MessageRole::System => {}
            }
        }

        let options = GenerateOptions {
            temperature: Some(0.3),
            max_tokens: Some(400),
        };
        match provider.generate(&messages, &options).await {
            Ok(response) if !response.text.trim().is_empty() => response.text.trim().to_string(),
            _ => HELP_TEXT.to_string(),
        }
    }

    /// Post into the session's thread when it has one, else the channel.
    async fn post(&self, session: &ConversationSession, text: &str) {
        let thread_ts = session.channel_ref.split(':').nth(1).filter(|part| {
            // "<channel>:slash:<user>" sessions have no real thread.
            *part != "slash" && *part != "new"
        });

        let result = match thread_ts {
            Some(ts) => self.deps.notifier.post_thread_reply(ts, text).await,
            None => self.deps.notifier.post_channel_message(text).await,
        };

        match result {
            Ok(_) => {}
            Err(ChatError::NotConfigured) => {
                debug!("Slack unconfigured; conversation reply not posted");
            }
            Err(e) => warn!(error = %e, "Conversation reply post failed"),
        }
    }
}

fn field(event: &Value, name: &str) -> ChatResult<String> {
    event
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ChatError::MalformedPayload(format!("missing field '{name}'")))
}
