//! Typed Railway API client.
//!
//! Wraps the GraphQL endpoint with bearer auth, bounded retries, and the
//! global rate limiter. Queries return `serde_json::Value` data payloads;
//! the typed helpers extract what the pipeline needs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rate_limit::RateLimiter;
use crate::{PlatformError, PlatformResult};

/// Railway GraphQL endpoint.
pub const RAILWAY_API_URL: &str = "https://backboard.railway.com/graphql/v2";

/// Request timeout for platform RPCs.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Transient failures are retried this many times.
const MAX_TRANSIENT_RETRIES: u32 = 3;

/// 429s get their own retry budget.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Base backoff between retries.
const RETRY_BASE: Duration = Duration::from_secs(1);

/// Default requests-per-second budget.
pub const DEFAULT_RATE_LIMIT_SEC: u32 = 50;

/// Default requests-per-hour budget.
pub const DEFAULT_RATE_LIMIT_HR: u32 = 10_000;

/// A deployment as listed by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Client for the Railway GraphQL API.
#[derive(Clone)]
pub struct RailwayClient {
    http: reqwest::Client,
    token: Option<String>,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl RailwayClient {
    /// Create a client. `token = None` produces a client whose every call
    /// fails fast with [`PlatformError::NotConfigured`].
    #[must_use]
    pub fn new(token: Option<String>, rate_limit_sec: u32, rate_limit_hr: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            http,
            token,
            base_url: RAILWAY_API_URL.to_string(),
            limiter: Arc::new(RateLimiter::new(rate_limit_sec, rate_limit_hr)),
        }
    }

    /// Override the endpoint (tests).
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Whether a token is present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    /// The bearer token, for the websocket layer.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Execute a GraphQL operation with retries and rate limiting.
    pub async fn graphql(&self, query: &str, variables: Value) -> PlatformResult<Value> {
        let token = self.token.as_ref().ok_or(PlatformError::NotConfigured)?;

        let mut transient_retries = 0u32;
        let mut rate_limit_retries = 0u32;

        loop {
            self.limiter.acquire().await;

            let result = self
                .http
                .post(&self.base_url)
                .bearer_auth(token)
                .json(&json!({ "query": query, "variables": variables }))
                .send()
                .await;

            let error = match result {
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 429 {
                        PlatformError::RateLimited
                    } else if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(PlatformError::Unauthorized);
                    } else if status.is_client_error() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(PlatformError::Api(format!("{status}: {body}")));
                    } else if status.is_server_error() {
                        PlatformError::Transport(format!("server error {status}"))
                    } else {
                        let body: Value = response.json().await.map_err(|e| {
                            PlatformError::InvalidResponse(format!("non-JSON body: {e}"))
                        })?;
                        return parse_envelope(body);
                    }
                }
                Err(e) if e.is_timeout() => PlatformError::Timeout,
                Err(e) => PlatformError::Transport(e.to_string()),
            };

            let (budget, used) = match &error {
                PlatformError::RateLimited => (MAX_RATE_LIMIT_RETRIES, &mut rate_limit_retries),
                _ => (MAX_TRANSIENT_RETRIES, &mut transient_retries),
            };

            *used += 1;
            if *used > budget {
                return Err(error);
            }

            let delay = RETRY_BASE * 2u32.pow(*used - 1);
            warn!(
                error = %error,
                attempt = *used,
                delay_ms = delay.as_millis() as u64,
                "Railway request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    // -------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------

    /// Fetch a service with its instances.
    pub async fn service(&self, service_id: &str) -> PlatformResult<Value> {
        self.graphql(queries::SERVICE, json!({ "id": service_id }))
            .await
    }

    /// Fetch a single deployment.
    pub async fn deployment(&self, deployment_id: &str) -> PlatformResult<Value> {
        self.graphql(queries::DEPLOYMENT, json!({ "id": deployment_id }))
            .await
    }

    /// Status string of a deployment (`SUCCESS`, `CRASHED`, ...).
    pub async fn deployment_status(&self, deployment_id: &str) -> PlatformResult<String> {
        let data = self.deployment(deployment_id).await?;
        data.pointer("/deployment/status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PlatformError::InvalidResponse("deployment.status missing".into()))
    }

    /// List recent deployments for a service in an environment, newest
    /// first.
    pub async fn deployments(
        &self,
        project_id: &str,
        environment_id: &str,
        service_id: &str,
        limit: u32,
    ) -> PlatformResult<Vec<Deployment>> {
        let data = self
            .graphql(
                queries::DEPLOYMENTS,
                json!({
                    "input": {
                        "projectId": project_id,
                        "environmentId": environment_id,
                        "serviceId": service_id,
                    },
                    "first": limit,
                }),
            )
            .await?;

        let edges = data
            .pointer("/deployments/edges")
            .and_then(Value::as_array)
            .ok_or_else(|| PlatformError::InvalidResponse("deployments.edges missing".into()))?;

        let mut deployments = Vec::with_capacity(edges.len());
        for edge in edges {
            let node = edge
                .get("node")
                .ok_or_else(|| PlatformError::InvalidResponse("deployment edge without node".into()))?;
            let deployment: Deployment = serde_json::from_value(node.clone())
                .map_err(|e| PlatformError::InvalidResponse(format!("deployment node: {e}")))?;
            deployments.push(deployment);
        }
        Ok(deployments)
    }

    /// The latest deployment id for a service within an environment.
    pub async fn latest_deployment_id(
        &self,
        _project_id: &str,
        environment_id: &str,
        service_id: &str,
    ) -> PlatformResult<String> {
        let data = self.service(service_id).await?;
        derive_latest_deployment(&data, service_id, environment_id)
    }

    /// The rollback target: the second-most-recent SUCCESS deployment.
    pub async fn previous_deployment_id(
        &self,
        project_id: &str,
        environment_id: &str,
        service_id: &str,
    ) -> PlatformResult<String> {
        let deployments = self
            .deployments(project_id, environment_id, service_id, 20)
            .await?;
        derive_previous_deployment(&deployments)
            .map(|d| d.id.clone())
            .ok_or_else(|| PlatformError::NoRollbackTarget(service_id.to_string()))
    }

    /// Recent log lines for a deployment, bounded to `limit`.
    pub async fn deployment_logs(
        &self,
        deployment_id: &str,
        limit: u32,
    ) -> PlatformResult<Vec<String>> {
        let data = self
            .graphql(
                queries::DEPLOYMENT_LOGS,
                json!({ "deploymentId": deployment_id, "limit": limit }),
            )
            .await?;

        let entries = data
            .pointer("/deploymentLogs")
            .and_then(Value::as_array)
            .ok_or_else(|| PlatformError::InvalidResponse("deploymentLogs missing".into()))?;

        Ok(entries
            .iter()
            .filter_map(|entry| entry.get("message").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Environment variables for a service.
    pub async fn variables(
        &self,
        project_id: &str,
        environment_id: &str,
        service_id: &str,
    ) -> PlatformResult<Value> {
        self.graphql(
            queries::VARIABLES,
            json!({
                "projectId": project_id,
                "environmentId": environment_id,
                "serviceId": service_id,
            }),
        )
        .await
    }

    /// Resource metrics for a service.
    pub async fn metrics(
        &self,
        environment_id: &str,
        service_id: &str,
        since: DateTime<Utc>,
    ) -> PlatformResult<Value> {
        self.graphql(
            queries::METRICS,
            json!({
                "environmentId": environment_id,
                "serviceId": service_id,
                "startDate": since.to_rfc3339(),
            }),
        )
        .await
    }

    // -------------------------------------------------------------------
    // Mutations
    //
    // Every mutation carries a caller-supplied correlation id so a retried
    // action can be matched to platform state before re-issuing.
    // -------------------------------------------------------------------

    /// Restart a deployment in place.
    pub async fn restart_deployment(
        &self,
        deployment_id: &str,
        correlation_id: Uuid,
    ) -> PlatformResult<()> {
        debug!(deployment_id = %deployment_id, correlation_id = %correlation_id, "restartDeployment");
        self.graphql(queries::RESTART_DEPLOYMENT, json!({ "id": deployment_id }))
            .await
            .map(|_| ())
    }

    /// Rebuild and deploy the latest code for a deployment.
    pub async fn redeploy_deployment(
        &self,
        deployment_id: &str,
        correlation_id: Uuid,
    ) -> PlatformResult<()> {
        debug!(deployment_id = %deployment_id, correlation_id = %correlation_id, "deploymentRedeploy");
        self.graphql(queries::REDEPLOY_DEPLOYMENT, json!({ "id": deployment_id }))
            .await
            .map(|_| ())
    }

    /// Stop a running deployment.
    pub async fn stop_deployment(
        &self,
        deployment_id: &str,
        correlation_id: Uuid,
    ) -> PlatformResult<()> {
        debug!(deployment_id = %deployment_id, correlation_id = %correlation_id, "deploymentStop");
        self.graphql(queries::STOP_DEPLOYMENT, json!({ "id": deployment_id }))
            .await
            .map(|_| ())
    }

    /// Cancel an in-progress deployment.
    pub async fn cancel_deployment(
        &self,
        deployment_id: &str,
        correlation_id: Uuid,
    ) -> PlatformResult<()> {
        debug!(deployment_id = %deployment_id, correlation_id = %correlation_id, "deploymentCancel");
        self.graphql(queries::CANCEL_DEPLOYMENT, json!({ "id": deployment_id }))
            .await
            .map(|_| ())
    }

    /// Roll back to a prior deployment.
    pub async fn rollback_deployment(
        &self,
        deployment_id: &str,
        correlation_id: Uuid,
    ) -> PlatformResult<()> {
        debug!(deployment_id = %deployment_id, correlation_id = %correlation_id, "deploymentRollback");
        self.graphql(queries::ROLLBACK_DEPLOYMENT, json!({ "id": deployment_id }))
            .await
            .map(|_| ())
    }

    /// Restart every instance of a service in an environment.
    pub async fn restart_service(
        &self,
        service_id: &str,
        environment_id: &str,
        correlation_id: Uuid,
    ) -> PlatformResult<()> {
        debug!(
            service_id = %service_id,
            environment_id = %environment_id,
            correlation_id = %correlation_id,
            "serviceInstanceRestart"
        );
        self.graphql(
            queries::RESTART_SERVICE,
            json!({ "serviceId": service_id, "environmentId": environment_id }),
        )
        .await
        .map(|_| ())
    }

    /// Set the replica count of a service instance.
    pub async fn update_service_instance(
        &self,
        environment_id: &str,
        service_id: &str,
        num_replicas: u32,
        correlation_id: Uuid,
    ) -> PlatformResult<()> {
        debug!(
            service_id = %service_id,
            replicas = num_replicas,
            correlation_id = %correlation_id,
            "serviceInstanceUpdate"
        );
        self.graphql(
            queries::UPDATE_SERVICE_INSTANCE,
            json!({
                "serviceId": service_id,
                "environmentId": environment_id,
                "input": { "numReplicas": num_replicas },
            }),
        )
        .await
        .map(|_| ())
    }

    /// Set the memory limit of a service instance.
    pub async fn update_service_limits(
        &self,
        environment_id: &str,
        service_id: &str,
        memory_mb: u32,
        correlation_id: Uuid,
    ) -> PlatformResult<()> {
        debug!(
            service_id = %service_id,
            memory_mb = memory_mb,
            correlation_id = %correlation_id,
            "serviceInstanceLimitsUpdate"
        );
        self.graphql(
            queries::UPDATE_SERVICE_LIMITS,
            json!({
                "serviceId": service_id,
                "environmentId": environment_id,
                "input": { "memoryGB": f64::from(memory_mb) / 1024.0 },
            }),
        )
        .await
        .map(|_| ())
    }

    /// Upsert an environment variable.
    pub async fn upsert_variable(
        &self,
        project_id: &str,
        environment_id: &str,
        service_id: &str,
        name: &str,
        value: &str,
    ) -> PlatformResult<()> {
        self.graphql(
            queries::UPSERT_VARIABLE,
            json!({
                "input": {
                    "projectId": project_id,
                    "environmentId": environment_id,
                    "serviceId": service_id,
                    "name": name,
                    "value": value,
                },
            }),
        )
        .await
        .map(|_| ())
    }
}

/// Split a GraphQL envelope into data or a joined error.
pub(crate) fn parse_envelope(body: Value) -> PlatformResult<Value> {
    match body.get("errors") {
        Some(errors) if !errors.is_null() => {
            let joined = errors
                .as_array()
                .map(|list| {
                    list.iter()
                        .filter_map(|e| e.get("message").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| errors.to_string());
            Err(PlatformError::Api(joined))
        }
        _ => body
            .get("data")
            .cloned()
            .ok_or_else(|| PlatformError::InvalidResponse("neither data nor errors".into())),
    }
}

/// Pick the latest deployment id out of a service payload.
pub(crate) fn derive_latest_deployment(
    data: &Value,
    service_id: &str,
    environment_id: &str,
) -> PlatformResult<String> {
    let edges = data
        .pointer("/service/serviceInstances/edges")
        .and_then(Value::as_array)
        .ok_or_else(|| PlatformError::InvalidResponse("serviceInstances.edges missing".into()))?;

    let instance = edges
        .iter()
        .filter_map(|edge| edge.get("node"))
        .find(|node| {
            node.get("environmentId").and_then(Value::as_str) == Some(environment_id)
        })
        .ok_or_else(|| PlatformError::NoInstanceForEnvironment {
            service_id: service_id.to_string(),
            environment_id: environment_id.to_string(),
        })?;

    instance
        .pointer("/latestDeployment/id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PlatformError::NoDeployment(service_id.to_string()))
}

/// Rollback target derivation: skip the most recent deployment, then take
/// the first SUCCESS.
pub(crate) fn derive_previous_deployment(deployments: &[Deployment]) -> Option<&Deployment> {
    deployments
        .iter()
        .skip(1)
        .find(|d| d.status.eq_ignore_ascii_case("success"))
}

mod queries {
    pub const SERVICE: &str = r"
        query service($id: String!) {
            service(id: $id) {
                id
                name
                serviceInstances {
                    edges {
                        node {
                            environmentId
                            latestDeployment { id status }
                        }
                    }
                }
            }
        }
    ";

    pub const DEPLOYMENT: &str = r"
        query deployment($id: String!) {
            deployment(id: $id) { id status createdAt }
        }
    ";

    pub const DEPLOYMENTS: &str = r"
        query deployments($input: DeploymentListInput!, $first: Int!) {
            deployments(input: $input, first: $first) {
                edges { node { id status createdAt } }
            }
        }
    ";

    pub const DEPLOYMENT_LOGS: &str = r"
        query deploymentLogs($deploymentId: String!, $limit: Int!) {
            deploymentLogs(deploymentId: $deploymentId, limit: $limit) {
                timestamp severity message
            }
        }
    ";

    pub const VARIABLES: &str = r"
        query variables($projectId: String!, $environmentId: String!, $serviceId: String!) {
            variables(projectId: $projectId, environmentId: $environmentId, serviceId: $serviceId)
        }
    ";

    pub const METRICS: &str = r"
        query metrics($environmentId: String!, $serviceId: String!, $startDate: DateTime!) {
            metrics(
                environmentId: $environmentId
                serviceId: $serviceId
                startDate: $startDate
                measurements: [CPU_USAGE, MEMORY_USAGE_GB]
            ) {
                measurement
                values { ts value }
            }
        }
    ";

    pub const RESTART_DEPLOYMENT: &str = r"
        mutation deploymentRestart($id: String!) { deploymentRestart(id: $id) }
    ";

    pub const REDEPLOY_DEPLOYMENT: &str = r"
        mutation deploymentRedeploy($id: String!) { deploymentRedeploy(id: $id) { id } }
    ";

    pub const STOP_DEPLOYMENT: &str = r"
        mutation deploymentStop($id: String!) { deploymentStop(id: $id) }
    ";

    pub const CANCEL_DEPLOYMENT: &str = r"
        mutation deploymentCancel($id: String!) { deploymentCancel(id: $id) }
    ";

    pub const ROLLBACK_DEPLOYMENT: &str = r"
        mutation deploymentRollback($id: String!) { deploymentRollback(id: $id) }
    ";

    pub const RESTART_SERVICE: &str = r"
        mutation serviceInstanceRedeploy($serviceId: String!, $environmentId: String!) {
            serviceInstanceRedeploy(serviceId: $serviceId, environmentId: $environmentId)
        }
    ";

    pub const UPDATE_SERVICE_INSTANCE: &str = r"
        mutation serviceInstanceUpdate(
            $serviceId: String!
            $environmentId: String!
            $input: ServiceInstanceUpdateInput!
        ) {
            serviceInstanceUpdate(
                serviceId: $serviceId
                environmentId: $environmentId
                input: $input
            )
        }
    ";

    pub const UPDATE_SERVICE_LIMITS: &str = r"
        mutation serviceInstanceLimitsUpdate(
            $serviceId: String!
            $environmentId: String!
            $input: ServiceInstanceLimitsUpdateInput!
        ) {
            serviceInstanceLimitsUpdate(
                serviceId: $serviceId
                environmentId: $environmentId
                input: $input
            )
        }
    ";

    pub const UPSERT_VARIABLE: &str = r"
        mutation variableUpsert($input: VariableUpsertInput!) {
            variableUpsert(input: $input)
        }
    ";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_token_fails_without_io() {
        // Unroutable base URL: if the client attempted I/O the error would
        // be Transport, not NotConfigured.
        let client = RailwayClient::new(None, 50, 10_000)
            .with_base_url("http://127.0.0.1:1/graphql");
        let err = client.graphql("query { me }", json!({})).await.unwrap_err();
        assert!(matches!(err, PlatformError::NotConfigured));
    }

    #[test]
    fn envelope_with_errors() {
        let body = json!({
            "data": null,
            "errors": [
                { "message": "Not Authorized" },
                { "message": "Problem processing request" }
            ]
        });
        let err = parse_envelope(body).unwrap_err();
        match err {
            PlatformError::Api(message) => {
                assert_eq!(message, "Not Authorized; Problem processing request");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn envelope_with_data() {
        let body = json!({ "data": { "service": { "id": "svc-1" } } });
        let data = parse_envelope(body).unwrap();
        assert_eq!(data["service"]["id"], "svc-1");
    }

    #[test]
    fn latest_deployment_filters_by_environment() {
        let data = json!({
            "service": {
                "serviceInstances": {
                    "edges": [
                        { "node": { "environmentId": "env-a", "latestDeployment": { "id": "dep-a", "status": "SUCCESS" } } },
                        { "node": { "environmentId": "env-b", "latestDeployment": { "id": "dep-b", "status": "SUCCESS" } } }
                    ]
                }
            }
        });

        let id = derive_latest_deployment(&data, "svc-1", "env-b").unwrap();
        assert_eq!(id, "dep-b");
    }

    #[test]
    fn latest_deployment_distinct_errors() {
        let data = json!({
            "service": {
                "serviceInstances": {
                    "edges": [
                        { "node": { "environmentId": "env-a", "latestDeployment": null } }
                    ]
                }
            }
        });

        assert!(matches!(
            derive_latest_deployment(&data, "svc-1", "env-z"),
            Err(PlatformError::NoInstanceForEnvironment { .. })
        ));
        assert!(matches!(
            derive_latest_deployment(&data, "svc-1", "env-a"),
            Err(PlatformError::NoDeployment(_))
        ));
    }

    #[test]
    fn rollback_target_skips_latest_and_failed() {
        let deployments = vec![
            Deployment {
                id: "dep-3".into(),
                status: "SUCCESS".into(),
                created_at: Utc::now(),
            },
            Deployment {
                id: "dep-2".into(),
                status: "CRASHED".into(),
                created_at: Utc::now(),
            },
            Deployment {
                id: "dep-1".into(),
                status: "SUCCESS".into(),
                created_at: Utc::now(),
            },
        ];

        let target = derive_previous_deployment(&deployments).unwrap();
        assert_eq!(target.id, "dep-1");
    }

    #[test]
    fn rollback_target_absent() {
        let deployments = vec![Deployment {
            id: "dep-1".into(),
            status: "SUCCESS".into(),
            created_at: Utc::now(),
        }];
        assert!(derive_previous_deployment(&deployments).is_none());
    }
}
