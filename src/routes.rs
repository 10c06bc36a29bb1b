use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::health;
use crate::lifecycle::{self, GraphQLRequest, InboundRequest};
use crate::metrics;

pub fn build_router(ctx: AppContext) -> Router {
    let cors = cors_layer(&ctx.config.allowed_origins);

    Router::new()
        .route("/graphql", post(graphql_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn graphql_handler(
    State(ctx): State<AppContext>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<GraphQLRequest>,
) -> Response {
    let inbound = InboundRequest {
        origin: caller_origin(&headers, peer),
        authorization: header_string(&headers, header::AUTHORIZATION.as_str()),
        correlation_id: header_string(&headers, "x-correlation-id"),
        body,
    };

    let result = lifecycle::execute(&ctx, inbound).await;

    let mut response = (result.status, Json(result.body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&result.correlation_id) {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}

/// Caller network origin: first `x-forwarded-for` hop, else the peer address.
fn caller_origin(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn health_handler(State(ctx): State<AppContext>) -> Response {
    Json(health::health_report(&ctx).await).into_response()
}

async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_wins_over_peer_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.2".parse().unwrap());
        let peer: SocketAddr = "10.0.0.1:55000".parse().unwrap();
        assert_eq!(caller_origin(&headers, peer), "203.0.113.9");
    }

    #[test]
    fn peer_address_is_the_fallback_origin() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "10.0.0.1:55000".parse().unwrap();
        assert_eq!(caller_origin(&headers, peer), "10.0.0.1");
    }
}
