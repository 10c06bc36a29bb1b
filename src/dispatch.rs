// ============================================================================
// Subgraph Dispatch
// ============================================================================
//
// Executes one sub-request against the backend that owns its fields. Every
// outbound call carries the caller's unmodified credential, the resolved
// identity as trust headers, and the operation's correlation id, so the
// backend can do its own checks without re-verifying the token.
//
// ============================================================================

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::auth::Identity;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics;

/// One decomposed portion of an inbound operation, bound for one subgraph.
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub service: String,
    pub url: String,
    /// Reassembled operation text containing only this subgraph's fields.
    pub query: String,
    pub operation_name: Option<String>,
    pub variables: Option<Value>,
    /// Response keys this sub-request is expected to populate.
    pub field_keys: Vec<String>,
}

/// A subgraph's reply: GraphQL `data` and `errors`.
#[derive(Debug, Clone, Default)]
pub struct SubResponse {
    pub data: Option<Value>,
    pub errors: Vec<Value>,
}

/// Headers propagated on every sub-request.
#[derive(Debug, Clone)]
pub struct ForwardHeaders {
    /// Original `authorization` header, forwarded unmodified.
    pub authorization: Option<String>,
    pub correlation_id: String,
    pub user_id: Option<String>,
    /// Role set as a JSON array string.
    pub user_roles: Option<String>,
}

impl ForwardHeaders {
    pub fn new(
        authorization: Option<&str>,
        correlation_id: &str,
        identity: Option<&Identity>,
    ) -> Self {
        Self {
            authorization: authorization.map(str::to_string),
            correlation_id: correlation_id.to_string(),
            user_id: identity.map(|i| i.subject.clone()),
            user_roles: identity
                .map(|i| serde_json::to_string(&i.roles).unwrap_or_else(|_| "[]".to_string())),
        }
    }
}

/// Seam between the planner and the wire. The HTTP implementation is the
/// production path; tests script their own.
#[async_trait]
pub trait SubgraphTransport: Send + Sync {
    async fn execute(
        &self,
        request: &SubRequest,
        headers: &ForwardHeaders,
    ) -> GatewayResult<SubResponse>;
}

/// Pooled reqwest transport.
pub struct HttpSubgraphTransport {
    client: reqwest::Client,
}

impl HttpSubgraphTransport {
    pub fn new(timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create subgraph HTTP client");
        Self { client }
    }
}

#[async_trait]
impl SubgraphTransport for HttpSubgraphTransport {
    async fn execute(
        &self,
        request: &SubRequest,
        headers: &ForwardHeaders,
    ) -> GatewayResult<SubResponse> {
        let body = json!({
            "query": request.query,
            "operationName": request.operation_name,
            "variables": request.variables,
        });

        let mut outbound = self
            .client
            .post(&request.url)
            .header("x-correlation-id", &headers.correlation_id)
            .json(&body);
        if let Some(authz) = &headers.authorization {
            outbound = outbound.header("authorization", authz);
        }
        if let Some(user_id) = &headers.user_id {
            outbound = outbound.header("x-user-id", user_id);
        }
        if let Some(roles) = &headers.user_roles {
            outbound = outbound.header("x-user-roles", roles);
        }

        let started = Instant::now();
        let result = outbound.send().await;
        let elapsed = started.elapsed().as_secs_f64();
        metrics::SUBGRAPH_LATENCY
            .with_label_values(&[&request.service])
            .observe(elapsed);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                metrics::SUBGRAPH_REQUESTS_TOTAL
                    .with_label_values(&[&request.service, "error"])
                    .inc();
                if e.is_timeout() {
                    return Err(GatewayError::UpstreamTimeout {
                        service: request.service.clone(),
                    });
                }
                return Err(GatewayError::Upstream {
                    service: request.service.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let status = response.status();
        tracing::info!(
            service = %request.service,
            status = %status.as_u16(),
            latency_secs = elapsed,
            correlation_id = %headers.correlation_id,
            "Subgraph response"
        );

        if !status.is_success() {
            metrics::SUBGRAPH_REQUESTS_TOTAL
                .with_label_values(&[&request.service, "error"])
                .inc();
            return Err(GatewayError::Upstream {
                service: request.service.clone(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        metrics::SUBGRAPH_REQUESTS_TOTAL
            .with_label_values(&[&request.service, "success"])
            .inc();

        let payload: Value = response.json().await.map_err(|e| GatewayError::Upstream {
            service: request.service.clone(),
            reason: format!("invalid response body: {}", e),
        })?;

        let errors = payload
            .get("errors")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let data = payload.get("data").filter(|d| !d.is_null()).cloned();

        Ok(SubResponse { data, errors })
    }
}
