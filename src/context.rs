use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::auth::{ClaimsVerifier, Identity};
use crate::config::Config;
use crate::dispatch::SubgraphTransport;
use crate::policy::PolicySet;
use crate::rate_limit::RateLimiter;
use crate::registry::ServiceRegistry;

/// Correlation state for one inbound operation.
///
/// Unique per operation, threaded through every sub-request and every
/// log/metric emission, and dropped when the operation completes.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    pub correlation_id: String,
    pub started_at: Instant,
    /// Resolved identity; absent until (and unless) a credential is verified.
    pub identity: Option<Identity>,
}

impl CorrelationContext {
    /// Reuse a caller-supplied correlation id, or mint a fresh one.
    pub fn new(supplied_id: Option<&str>) -> Self {
        let correlation_id = supplied_id
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            correlation_id,
            started_at: Instant::now(),
            identity: None,
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

/// Shared gateway dependencies, assembled once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub verifier: Arc<ClaimsVerifier>,
    pub policies: Arc<PolicySet>,
    pub rate_limiter: Arc<RateLimiter>,
    pub registry: Arc<ServiceRegistry>,
    pub transport: Arc<dyn SubgraphTransport>,
}

impl AppContext {
    pub fn new(
        config: Arc<Config>,
        verifier: Arc<ClaimsVerifier>,
        policies: Arc<PolicySet>,
        rate_limiter: Arc<RateLimiter>,
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn SubgraphTransport>,
    ) -> Self {
        Self {
            config,
            verifier,
            policies,
            rate_limiter,
            registry,
            transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_supplied_correlation_id() {
        let ctx = CorrelationContext::new(Some("caller-supplied-id"));
        assert_eq!(ctx.correlation_id, "caller-supplied-id");
    }

    #[test]
    fn generates_unique_ids_when_absent() {
        let a = CorrelationContext::new(None);
        let b = CorrelationContext::new(None);
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn blank_supplied_id_is_replaced() {
        let ctx = CorrelationContext::new(Some("   "));
        assert!(!ctx.correlation_id.trim().is_empty());
        assert_ne!(ctx.correlation_id, "   ");
    }
}
