use anyhow::{Context, Result};
use std::collections::BTreeMap;

// ============================================================================
// Configuration Constants
// ============================================================================

const DEFAULT_PORT: u16 = 4000;

// Rate limiting defaults: 100 points per rolling 60-second window
const DEFAULT_RATE_LIMIT_POINTS: u32 = 100;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

// Query shape defaults (match the limits the composed schema was sized for)
const DEFAULT_MAX_QUERY_DEPTH: usize = 10;
const DEFAULT_MAX_QUERY_COMPLEXITY: usize = 1000;

const DEFAULT_JWT_LEEWAY_SECS: u64 = 30;
const DEFAULT_REGISTRY_REFRESH_SECS: u64 = 60;
const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 30;

/// Env var prefix for subgraph registration: `SUBGRAPH_FINANCE_URL=http://...`
/// registers a subgraph named `finance`.
const SUBGRAPH_ENV_PREFIX: &str = "SUBGRAPH_";
const SUBGRAPH_ENV_SUFFIX: &str = "_URL";

// ============================================================================
// Configuration Structures
// ============================================================================

/// Deployment environment. Production hides internal error detail and
/// disables verbose debugging surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Credential verification settings.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// HS256 signing secret shared with the identity provider.
    pub jwt_secret: String,
    /// Issuers accepted during validation.
    pub accepted_issuers: Vec<String>,
    /// Allowed clock skew in seconds when checking `exp`/`iat`.
    pub leeway_secs: u64,
}

/// Admission control settings.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Points allotted to each key per window.
    pub points: u32,
    /// Window duration in seconds.
    pub window_secs: u64,
}

/// Query shape limits, enforced before authorization and routing.
#[derive(Clone, Debug)]
pub struct LimitsConfig {
    pub max_query_depth: usize,
    pub max_query_complexity: usize,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub environment: Environment,
    pub redis_url: String,
    /// Subgraph name → base URL, from `SUBGRAPH_<NAME>_URL` variables.
    pub subgraphs: BTreeMap<String, String>,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub limits: LimitsConfig,
    /// Origins allowed for cross-origin calls (comma-separated env list).
    pub allowed_origins: Vec<String>,
    /// Seconds between capability re-introspection passes.
    pub registry_refresh_secs: u64,
    /// Deadline for the whole fan-out of one operation.
    pub dispatch_timeout_secs: u64,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let subgraphs = collect_subgraphs();
        if subgraphs.is_empty() {
            anyhow::bail!(
                "No subgraphs configured. Set at least one SUBGRAPH_<NAME>_URL variable, \
                e.g. SUBGRAPH_FINANCE_URL=http://finance-service:8082/graphql"
            );
        }

        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if jwt_secret.trim().is_empty() {
            anyhow::bail!("JWT_SECRET must not be empty");
        }

        let environment = match std::env::var("ENVIRONMENT").as_deref() {
            Ok("production") => Environment::Production,
            _ => Environment::Development,
        };

        Ok(Config {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            environment,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            subgraphs,
            auth: AuthConfig {
                jwt_secret,
                accepted_issuers: std::env::var("JWT_ISSUER")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
                leeway_secs: std::env::var("JWT_LEEWAY_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_JWT_LEEWAY_SECS),
            },
            rate_limit: RateLimitConfig {
                points: std::env::var("RATE_LIMIT_POINTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RATE_LIMIT_POINTS),
                window_secs: std::env::var("RATE_LIMIT_WINDOW_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            },
            limits: LimitsConfig {
                max_query_depth: std::env::var("MAX_QUERY_DEPTH")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_MAX_QUERY_DEPTH),
                max_query_complexity: std::env::var("MAX_QUERY_COMPLEXITY")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_MAX_QUERY_COMPLEXITY),
            },
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|_| vec!["http://localhost:3000".to_string()]),
            registry_refresh_secs: std::env::var("REGISTRY_REFRESH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REGISTRY_REFRESH_SECS),
            dispatch_timeout_secs: std::env::var("DISPATCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DISPATCH_TIMEOUT_SECS),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Scan the environment for `SUBGRAPH_<NAME>_URL` variables. The name segment
/// is lowercased: `SUBGRAPH_FINANCE_URL` registers subgraph `finance`.
fn collect_subgraphs() -> BTreeMap<String, String> {
    let mut subgraphs = BTreeMap::new();
    for (key, value) in std::env::vars() {
        if let Some(rest) = key.strip_prefix(SUBGRAPH_ENV_PREFIX) {
            if let Some(name) = rest.strip_suffix(SUBGRAPH_ENV_SUFFIX) {
                if !name.is_empty() && !value.trim().is_empty() {
                    subgraphs.insert(name.to_lowercase(), value.trim().to_string());
                }
            }
        }
    }
    subgraphs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_defaults_to_development() {
        assert!(!Environment::Development.is_production());
        assert!(Environment::Production.is_production());
    }

    #[test]
    fn subgraph_env_name_is_lowercased() {
        // collect_subgraphs reads the real environment; exercise the parsing
        // rule directly on a representative key instead.
        let key = "SUBGRAPH_FINANCE_URL";
        let name = key
            .strip_prefix(SUBGRAPH_ENV_PREFIX)
            .and_then(|r| r.strip_suffix(SUBGRAPH_ENV_SUFFIX))
            .map(str::to_lowercase);
        assert_eq!(name.as_deref(), Some("finance"));
    }
}
