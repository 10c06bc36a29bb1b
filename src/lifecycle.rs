// ============================================================================
// Request Lifecycle
// ============================================================================
//
// Runs one inbound operation end-to-end:
//
//   Received → RateLimited{admit|reject} → Authenticated{identity|anonymous|reject}
//            → Authorized{allow|deny per field} → Routed → Completed
//
// A stage failure halts everything after it; no subgraph is contacted after a
// rate-limit rejection, a failed verification, or a whole-operation
// validation error. Whatever the outcome, the operation's name, kind,
// duration, and terminal status are recorded.
//
// ============================================================================

use std::time::Duration;

use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::{AppContext, CorrelationContext};
use crate::dispatch::ForwardHeaders;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::plan::{merge_results, plan_operation, FieldFailure};
use crate::policy::{Decision, EvalCache, RequestScope};
use crate::query::{self, Operation, OperationKind};
use crate::rate_limit::{Admission, RateLimitKey};

/// Inbound `POST /graphql` body.
#[derive(Debug, Deserialize)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(rename = "operationName")]
    pub operation_name: Option<String>,
    pub variables: Option<Value>,
}

/// Everything the lifecycle needs from the HTTP layer.
#[derive(Debug)]
pub struct InboundRequest {
    /// Caller network origin (forwarded-for or peer address).
    pub origin: String,
    /// Raw `authorization` header, if present.
    pub authorization: Option<String>,
    /// Caller-supplied `x-correlation-id`, if present.
    pub correlation_id: Option<String>,
    pub body: GraphQLRequest,
}

#[derive(Debug)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub body: Value,
    pub correlation_id: String,
}

/// Execute one operation through every pipeline stage.
pub async fn execute(ctx: &AppContext, inbound: InboundRequest) -> GatewayResponse {
    let mut corr = CorrelationContext::new(inbound.correlation_id.as_deref());
    let expose_detail = !ctx.config.environment.is_production();

    let mut op_name = "unknown".to_string();
    let mut op_kind = "unknown";

    let outcome = run_stages(ctx, &inbound, &mut corr, &mut op_name, &mut op_kind).await;
    let duration = corr.elapsed_seconds();

    let (status, body, status_label) = match outcome {
        Ok((data, errors)) => {
            let status_label = if errors.is_empty() {
                "success"
            } else if data.is_null() {
                "error"
            } else {
                "partial"
            };
            let mut body = json!({ "data": data });
            if !errors.is_empty() {
                body["errors"] = Value::Array(errors);
            }
            (StatusCode::OK, body, status_label)
        }
        Err(err) => {
            err.log(&corr.correlation_id);
            let status = err.status_code();
            let body = if let GatewayError::RateLimited { retry_after } = &err {
                json!({ "error": "Too many requests", "retryAfter": retry_after })
            } else {
                json!({ "errors": [err.to_graphql_error(&corr.correlation_id, expose_detail)] })
            };
            (status, body, "error")
        }
    };

    metrics::REQUESTS_TOTAL
        .with_label_values(&[&op_name, op_kind, status_label])
        .inc();
    metrics::REQUEST_DURATION
        .with_label_values(&[&op_name, op_kind])
        .observe(duration);

    tracing::info!(
        operation_name = %op_name,
        operation_type = %op_kind,
        status = %status_label,
        duration_secs = duration,
        correlation_id = %corr.correlation_id,
        "Request completed"
    );

    GatewayResponse {
        status,
        body,
        correlation_id: corr.correlation_id,
    }
}

async fn run_stages(
    ctx: &AppContext,
    inbound: &InboundRequest,
    corr: &mut CorrelationContext,
    op_name: &mut String,
    op_kind: &mut &'static str,
) -> GatewayResult<(Value, Vec<Value>)> {
    // Stage: rate-limit admission. Runs before anything else, so a point is
    // consumed even when verification later fails.
    let key = RateLimitKey::new(&inbound.origin, inbound.authorization.as_deref());
    match ctx.rate_limiter.admit(&key).await? {
        Admission::Admitted { .. } => {}
        Admission::Rejected { retry_after } => {
            metrics::RATE_LIMIT_REJECTIONS
                .with_label_values(&["quota_exhausted"])
                .inc();
            return Err(GatewayError::RateLimited { retry_after });
        }
    }

    // Stage: parse + shape limits, before authorization or routing.
    let operation = query::parse_operation(
        &inbound.body.query,
        inbound.body.operation_name.as_deref(),
    )?;
    *op_name = operation.display_name().to_string();
    *op_kind = operation.kind.as_str();
    query::enforce_limits(
        &operation,
        ctx.config.limits.max_query_depth,
        ctx.config.limits.max_query_complexity,
    )?;

    let parent = match operation.kind {
        OperationKind::Query => "Query",
        OperationKind::Mutation => "Mutation",
        OperationKind::Subscription => {
            return Err(GatewayError::validation(
                "subscriptions require a streaming transport and are not served by this endpoint",
            ))
        }
    };

    // Stage: authenticate. A present credential is always verified; a missing
    // one is only an error when the operation touches a protected field.
    let field_keys: Vec<String> = operation
        .fields
        .iter()
        .map(|f| format!("{}.{}", parent, f.name))
        .collect();
    let any_protected = ctx
        .policies
        .any_protected(field_keys.iter().map(String::as_str));

    let identity = match &inbound.authorization {
        Some(credential) => Some(ctx.verifier.verify(credential)?),
        None if any_protected => return Err(GatewayError::MissingCredential),
        None => None,
    };
    corr.identity = identity.clone();

    // Stage: authorize each touched field. Denials are field-scoped;
    // predicate faults abort the whole operation as authentication failures.
    let scope = RequestScope {
        operation_name: operation.name.clone(),
        correlation_id: corr.correlation_id.clone(),
    };
    let mut cache = EvalCache::new();
    let snapshot = ctx.registry.snapshot().await;

    let mut allowed = Vec::new();
    let mut denials = Vec::new();
    for (field, key) in operation.fields.iter().zip(&field_keys) {
        match ctx
            .policies
            .authorize(key, identity.as_ref(), &scope, &mut cache)?
        {
            Decision::Allowed => allowed.push(field.clone()),
            Decision::Denied(reason) => {
                tracing::debug!(
                    field = %key,
                    correlation_id = %corr.correlation_id,
                    "Field denied by policy"
                );
                let nullable = snapshot.resolve(key).map(|r| r.nullable).unwrap_or(true);
                denials.push(FieldFailure {
                    field_key: field.response_key().to_string(),
                    error: GatewayError::Forbidden {
                        field: key.clone(),
                        reason,
                    },
                    nullable,
                    omit: true,
                });
            }
        }
    }

    // Stage: plan + dispatch the surviving fields.
    let filtered = Operation {
        kind: operation.kind,
        name: operation.name.clone(),
        variable_defs: operation.variable_defs.clone(),
        fields: allowed,
    };
    let plan = plan_operation(&filtered, &snapshot, inbound.body.variables.as_ref())?;

    let headers = ForwardHeaders::new(
        inbound.authorization.as_deref(),
        &corr.correlation_id,
        identity.as_ref(),
    );
    let deadline = Duration::from_secs(ctx.config.dispatch_timeout_secs);
    let dispatches = plan.sub_requests.iter().map(|request| {
        let transport = ctx.transport.clone();
        let headers = headers.clone();
        async move {
            match tokio::time::timeout(deadline, transport.execute(request, &headers)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::UpstreamTimeout {
                    service: request.service.clone(),
                }),
            }
        }
    });
    let results = futures_util::future::join_all(dispatches).await;

    // Stage: merge partial results back into the operation's shape.
    Ok(merge_results(
        &plan,
        results,
        denials,
        &corr.correlation_id,
        !ctx.config.environment.is_production(),
    ))
}
