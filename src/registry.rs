// ============================================================================
// Service Registry - Capability Composition
// ============================================================================
//
// Maps composed-schema fields to the subgraph that owns them. The map is
// built by fetching each subgraph's capability document at startup and
// re-fetched periodically; the active snapshot is an immutable Arc replaced
// wholesale on rebuild, never mutated in place.
//
// A subgraph that stops answering keeps its last-known field set, marked
// unavailable, so the rest of the registry keeps serving. Total rebuild
// failure keeps the previous known-good snapshot and raises the staleness
// flag reported by /health.
//
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;

/// One backend subgraph service.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub name: String,
    pub url: String,
    pub available: bool,
}

/// Where a composed-schema field is served, and how failures propagate.
#[derive(Debug, Clone)]
pub struct FieldRoute {
    pub service: String,
    /// Non-nullable fields escalate their failure to the operation root.
    pub nullable: bool,
    pub available: bool,
}

/// Capability document published by each subgraph at `GET {url}/capabilities`.
#[derive(Debug, Deserialize)]
struct CapabilityDocument {
    fields: Vec<CapabilityField>,
}

#[derive(Debug, Deserialize)]
struct CapabilityField {
    /// Parent type in the composed schema: `Query` or `Mutation`.
    parent: String,
    name: String,
    #[serde(default = "default_nullable")]
    nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// Immutable composed view, shared read-only by all in-flight operations.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    /// `Type.field` → owning service route.
    routes: HashMap<String, FieldRoute>,
    endpoints: BTreeMap<String, ServiceEndpoint>,
}

impl RegistrySnapshot {
    pub fn resolve(&self, field_key: &str) -> Option<&FieldRoute> {
        self.routes.get(field_key)
    }

    pub fn endpoint(&self, service: &str) -> Option<&ServiceEndpoint> {
        self.endpoints.get(service)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &ServiceEndpoint> {
        self.endpoints.values()
    }
}

pub struct ServiceRegistry {
    /// Configured subgraphs: name → base URL.
    configured: BTreeMap<String, String>,
    http: reqwest::Client,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    stale: AtomicBool,
}

impl ServiceRegistry {
    pub fn new(configured: BTreeMap<String, String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .expect("Failed to create registry HTTP client");

        Self {
            configured,
            http,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            stale: AtomicBool::new(false),
        }
    }

    /// Build a registry directly from known routes. Used by tests and by
    /// deployments with a static composed schema.
    pub fn from_static(
        configured: BTreeMap<String, String>,
        routes: HashMap<String, FieldRoute>,
    ) -> Self {
        let endpoints = configured
            .iter()
            .map(|(name, url)| {
                (
                    name.clone(),
                    ServiceEndpoint {
                        name: name.clone(),
                        url: url.clone(),
                        available: true,
                    },
                )
            })
            .collect();
        let registry = Self::new(configured);
        *registry.snapshot.try_write().expect("fresh registry lock") =
            Arc::new(RegistrySnapshot { routes, endpoints });
        registry
    }

    /// Current composed view. Cheap to call per request.
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Whether the active snapshot is older than the last rebuild attempt.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    /// Fetch every subgraph's capability document and swap in a new snapshot.
    ///
    /// Per-service failure carries that service's last-known routes forward,
    /// marked unavailable. If no service answers at all the previous snapshot
    /// stays active.
    pub async fn rebuild(&self) {
        let previous = self.snapshot().await;

        let fetches = self.configured.iter().map(|(name, url)| {
            let http = self.http.clone();
            let name = name.clone();
            let url = url.clone();
            async move {
                let result = fetch_capabilities(&http, &url).await;
                (name, url, result)
            }
        });
        let results = futures_util::future::join_all(fetches).await;

        let mut routes = HashMap::new();
        let mut endpoints = BTreeMap::new();
        let mut any_ok = false;
        let mut any_failed = false;

        for (name, url, result) in results {
            match result {
                Ok(doc) => {
                    any_ok = true;
                    for field in doc.fields {
                        let key = format!("{}.{}", field.parent, field.name);
                        routes.insert(
                            key,
                            FieldRoute {
                                service: name.clone(),
                                nullable: field.nullable,
                                available: true,
                            },
                        );
                    }
                    endpoints.insert(
                        name.clone(),
                        ServiceEndpoint {
                            name,
                            url,
                            available: true,
                        },
                    );
                }
                Err(e) => {
                    any_failed = true;
                    tracing::warn!(
                        service = %name,
                        error = %e,
                        "Capability introspection failed, carrying last-known fields as unavailable"
                    );
                    for (key, route) in previous.routes.iter() {
                        if route.service == name {
                            let mut stale_route = route.clone();
                            stale_route.available = false;
                            routes.insert(key.clone(), stale_route);
                        }
                    }
                    endpoints.insert(
                        name.clone(),
                        ServiceEndpoint {
                            name,
                            url,
                            available: false,
                        },
                    );
                }
            }
        }

        if !any_ok && !previous.routes.is_empty() {
            // Nothing answered: keep serving the last known-good snapshot.
            self.stale.store(true, Ordering::Relaxed);
            tracing::error!("Registry rebuild failed for every subgraph, keeping previous snapshot");
            return;
        }

        self.stale.store(any_failed, Ordering::Relaxed);
        let route_count = routes.len();
        *self.snapshot.write().await = Arc::new(RegistrySnapshot { routes, endpoints });
        tracing::info!(routes = route_count, stale = any_failed, "Registry snapshot replaced");
    }

    /// Periodic re-introspection loop; runs until process shutdown.
    pub fn spawn_refresh(self: Arc<Self>, interval_secs: u64) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            // First tick fires immediately; the warm-up rebuild already ran.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.rebuild().await;
            }
        });
    }
}

async fn fetch_capabilities(
    http: &reqwest::Client,
    base_url: &str,
) -> anyhow::Result<CapabilityDocument> {
    let url = format!("{}/capabilities", base_url.trim_end_matches('/'));
    let response = http.get(&url).send().await?.error_for_status()?;
    Ok(response.json::<CapabilityDocument>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::{json, Value};
    use std::net::SocketAddr;

    /// Serve a canned capability document on an ephemeral local port.
    async fn serve_capabilities(doc: Value) -> SocketAddr {
        let app = Router::new().route(
            "/capabilities",
            get(move || {
                let doc = doc.clone();
                async move { Json(doc) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn static_registry() -> ServiceRegistry {
        let mut configured = BTreeMap::new();
        configured.insert("finance".to_string(), "http://finance:8082".to_string());
        configured.insert("inventory".to_string(), "http://inventory:8083".to_string());

        let mut routes = HashMap::new();
        routes.insert(
            "Query.financialData".to_string(),
            FieldRoute {
                service: "finance".to_string(),
                nullable: true,
                available: true,
            },
        );
        routes.insert(
            "Query.inventory".to_string(),
            FieldRoute {
                service: "inventory".to_string(),
                nullable: false,
                available: true,
            },
        );
        ServiceRegistry::from_static(configured, routes)
    }

    #[tokio::test]
    async fn resolves_fields_to_owning_service() {
        let registry = static_registry();
        let snapshot = registry.snapshot().await;

        let route = snapshot.resolve("Query.financialData").unwrap();
        assert_eq!(route.service, "finance");
        assert!(route.nullable);

        let route = snapshot.resolve("Query.inventory").unwrap();
        assert_eq!(route.service, "inventory");
        assert!(!route.nullable);

        assert!(snapshot.resolve("Query.unknownField").is_none());
    }

    #[tokio::test]
    async fn endpoints_are_exposed_for_health_reporting() {
        let registry = static_registry();
        let snapshot = registry.snapshot().await;
        let names: Vec<_> = snapshot.endpoints().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec!["finance", "inventory"]);
        assert!(!registry.is_stale());
    }

    #[tokio::test]
    async fn partial_rebuild_carries_failed_service_forward_as_unavailable() {
        let addr = serve_capabilities(json!({
            "fields": [
                {"parent": "Query", "name": "inventory", "nullable": true},
                {"parent": "Query", "name": "warehouses", "nullable": false},
            ]
        }))
        .await;

        let mut configured = BTreeMap::new();
        configured.insert("inventory".to_string(), format!("http://{}", addr));
        // Nothing listens here; the connection is refused.
        configured.insert("finance".to_string(), "http://127.0.0.1:1".to_string());

        // The previous snapshot knows finance's fields from an earlier pass.
        let mut routes = HashMap::new();
        routes.insert(
            "Query.financialData".to_string(),
            FieldRoute {
                service: "finance".to_string(),
                nullable: false,
                available: true,
            },
        );
        let registry = ServiceRegistry::from_static(configured, routes);

        registry.rebuild().await;

        let snapshot = registry.snapshot().await;

        // The healthy service's fields were refreshed from its document.
        let inv = snapshot.resolve("Query.inventory").unwrap();
        assert_eq!(inv.service, "inventory");
        assert!(inv.available);
        assert!(snapshot.resolve("Query.warehouses").is_some());

        // The failed service keeps its last-known fields, marked unavailable,
        // nullability intact, and the registry reports staleness.
        let fin = snapshot.resolve("Query.financialData").unwrap();
        assert!(!fin.available);
        assert!(!fin.nullable);
        assert!(!snapshot.endpoint("finance").unwrap().available);
        assert!(registry.is_stale());
    }

    #[tokio::test]
    async fn total_rebuild_failure_keeps_known_good_snapshot() {
        // Configured URLs point nowhere; the static snapshot must survive a
        // failed rebuild and the registry must flag staleness.
        let registry = static_registry();
        registry.rebuild().await;

        let snapshot = registry.snapshot().await;
        assert!(snapshot.resolve("Query.financialData").is_some());
        assert!(registry.is_stale());
    }
}
