use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::time::Instant;

use crate::context::AppContext;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

/// Pin the process start time. Called once from main before serving.
pub fn init_uptime() {
    Lazy::force(&STARTED_AT);
}

/// Liveness report: uptime, configured subgraphs, and registry staleness.
///
/// The gateway reports healthy even when subgraphs are down; per-service
/// availability is informational so an orchestrator does not restart the
/// gateway for a backend's outage.
pub async fn health_report(ctx: &AppContext) -> Value {
    let snapshot = ctx.registry.snapshot().await;
    let services: Vec<Value> = snapshot
        .endpoints()
        .map(|endpoint| {
            json!({
                "name": endpoint.name,
                "url": endpoint.url,
                "available": endpoint.available,
            })
        })
        .collect();

    json!({
        "status": "healthy",
        "uptime": STARTED_AT.elapsed().as_secs(),
        "registryStale": ctx.registry.is_stale(),
        "services": services,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ClaimsVerifier;
    use crate::config::{AuthConfig, Config, Environment, LimitsConfig, RateLimitConfig};
    use crate::dispatch::{ForwardHeaders, SubRequest, SubResponse, SubgraphTransport};
    use crate::error::GatewayResult;
    use crate::policy::default_policies;
    use crate::rate_limit::{MemoryCounterStore, RateLimiter};
    use crate::registry::{FieldRoute, ServiceRegistry};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    struct NullTransport;

    #[async_trait]
    impl SubgraphTransport for NullTransport {
        async fn execute(
            &self,
            _request: &SubRequest,
            _headers: &ForwardHeaders,
        ) -> GatewayResult<SubResponse> {
            Ok(SubResponse::default())
        }
    }

    fn ctx() -> AppContext {
        let config = Arc::new(Config {
            port: 0,
            environment: Environment::Development,
            redis_url: String::new(),
            subgraphs: BTreeMap::new(),
            auth: AuthConfig {
                jwt_secret: "secret".to_string(),
                accepted_issuers: vec![],
                leeway_secs: 30,
            },
            rate_limit: RateLimitConfig {
                points: 100,
                window_secs: 60,
            },
            limits: LimitsConfig {
                max_query_depth: 10,
                max_query_complexity: 1000,
            },
            allowed_origins: vec![],
            registry_refresh_secs: 60,
            dispatch_timeout_secs: 30,
            rust_log: "info".to_string(),
        });

        let mut configured = BTreeMap::new();
        configured.insert("finance".to_string(), "http://finance:8082".to_string());
        let registry = ServiceRegistry::from_static(configured, HashMap::<String, FieldRoute>::new());

        AppContext::new(
            config.clone(),
            Arc::new(ClaimsVerifier::new(&config.auth)),
            Arc::new(default_policies()),
            Arc::new(RateLimiter::new(
                Arc::new(MemoryCounterStore::new()),
                &config.rate_limit,
            )),
            Arc::new(registry),
            Arc::new(NullTransport),
        )
    }

    #[tokio::test]
    async fn reports_uptime_and_services() {
        init_uptime();
        let report = health_report(&ctx()).await;
        assert_eq!(report["status"], "healthy");
        assert!(report["uptime"].as_u64().is_some());
        assert_eq!(report["registryStale"], false);
        assert_eq!(report["services"][0]["name"], "finance");
        assert_eq!(report["services"][0]["available"], true);
    }
}
