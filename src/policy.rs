// ============================================================================
// Field Authorization Policies
// ============================================================================
//
// Boolean rule trees evaluated per protected field. A tree is composed once
// at startup from Leaf / And / Or / Not nodes and never mutated afterwards.
// Evaluation is depth-first with short-circuiting and a per-request cache
// that guarantees each leaf predicate runs at most once per operation, even
// when the same leaf is shared between trees.
//
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::auth::Identity;
use crate::error::{GatewayError, GatewayResult};

/// Outcome of evaluating a policy tree for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Request-scoped facts available to leaf predicates besides the identity.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    pub operation_name: Option<String>,
    pub correlation_id: String,
}

type Predicate =
    Arc<dyn Fn(Option<&Identity>, &RequestScope) -> Result<bool, String> + Send + Sync>;

/// A leaf rule: a named predicate over identity and request scope.
///
/// The `id` is the cache key; two leaves sharing an id share one evaluation
/// per request, so ids must be unique per distinct predicate.
#[derive(Clone)]
pub struct PolicyLeaf {
    id: String,
    /// When false (the default), evaluation with no identity denies without
    /// running the predicate.
    allow_anonymous: bool,
    predicate: Predicate,
}

impl PolicyLeaf {
    pub fn new<F>(id: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(Option<&Identity>, &RequestScope) -> Result<bool, String> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            allow_anonymous: false,
            predicate: Arc::new(predicate),
        }
    }

    pub fn allow_anonymous(mut self) -> Self {
        self.allow_anonymous = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for PolicyLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyLeaf")
            .field("id", &self.id)
            .field("allow_anonymous", &self.allow_anonymous)
            .finish()
    }
}

/// A node in a boolean authorization tree.
#[derive(Debug, Clone)]
pub enum PolicyNode {
    Leaf(PolicyLeaf),
    And(Vec<PolicyNode>),
    Or(Vec<PolicyNode>),
    Not(Box<PolicyNode>),
}

impl PolicyNode {
    pub fn and(children: Vec<PolicyNode>) -> Self {
        PolicyNode::And(children)
    }

    pub fn or(children: Vec<PolicyNode>) -> Self {
        PolicyNode::Or(children)
    }

    pub fn not(child: PolicyNode) -> Self {
        PolicyNode::Not(Box::new(child))
    }
}

/// Leaf requiring a verified identity.
pub fn authenticated() -> PolicyNode {
    PolicyNode::Leaf(PolicyLeaf::new("authenticated", |identity, _| {
        Ok(identity.is_some())
    }))
}

/// Leaf requiring a specific role claim.
pub fn has_role(role: &str) -> PolicyNode {
    let wanted = role.to_string();
    PolicyNode::Leaf(PolicyLeaf::new(format!("has_role:{}", role), move |identity, _| {
        Ok(identity.map(|i| i.has_role(&wanted)).unwrap_or(false))
    }))
}

/// Per-request evaluation cache: leaf id → predicate outcome.
///
/// Owned by one request and discarded with it. Results depend on the request's
/// identity, so this must never be shared across requests.
#[derive(Default)]
pub struct EvalCache {
    results: HashMap<String, Result<bool, String>>,
}

impl EvalCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, leaf_id: &str) -> Option<&Result<bool, String>> {
        self.results.get(leaf_id)
    }

    fn insert(&mut self, leaf_id: &str, result: Result<bool, String>) {
        self.results.insert(leaf_id.to_string(), result);
    }
}

/// Registry of policy trees keyed by `Type.field` (e.g. `Query.financialData`).
///
/// Fields with no registered tree are implicitly allowed. Default-permit is a
/// deliberate policy: the registered trees are the explicit security surface,
/// and backends re-check the forwarded credential for everything else.
#[derive(Default)]
pub struct PolicySet {
    trees: HashMap<String, Arc<PolicyNode>>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, field: impl Into<String>, tree: PolicyNode) {
        self.trees.insert(field.into(), Arc::new(tree));
    }

    pub fn is_protected(&self, field: &str) -> bool {
        self.trees.contains_key(field)
    }

    /// Whether any of the given fields has a registered policy tree.
    pub fn any_protected<'a>(&self, fields: impl IntoIterator<Item = &'a str>) -> bool {
        fields.into_iter().any(|f| self.is_protected(f))
    }

    /// Evaluate the tree registered for `field`.
    ///
    /// Returns `Decision::Allowed` for unregistered fields (default-permit).
    /// Predicate faults surface as `PredicateFailure`, an authentication-class
    /// error distinct from a `Denied` decision.
    pub fn authorize(
        &self,
        field: &str,
        identity: Option<&Identity>,
        scope: &RequestScope,
        cache: &mut EvalCache,
    ) -> GatewayResult<Decision> {
        let Some(tree) = self.trees.get(field) else {
            return Ok(Decision::Allowed);
        };

        match evaluate(tree, identity, scope, cache) {
            Ok(true) => Ok(Decision::Allowed),
            Ok(false) => Ok(Decision::Denied(format!(
                "policy for {} did not grant access",
                field
            ))),
            Err(reason) => Err(GatewayError::PredicateFailure {
                field: field.to_string(),
                reason,
            }),
        }
    }
}

/// Depth-first short-circuiting interpreter.
///
/// `And` stops at the first denial, `Or` at the first approval, `Not` inverts
/// its child. Predicate errors propagate immediately and are never converted
/// into a boolean, including under `Not`.
fn evaluate(
    node: &PolicyNode,
    identity: Option<&Identity>,
    scope: &RequestScope,
    cache: &mut EvalCache,
) -> Result<bool, String> {
    match node {
        PolicyNode::Leaf(leaf) => {
            if identity.is_none() && !leaf.allow_anonymous {
                return Ok(false);
            }
            if let Some(cached) = cache.get(&leaf.id) {
                return cached.clone();
            }
            let result = (leaf.predicate)(identity, scope);
            cache.insert(&leaf.id, result.clone());
            result
        }
        PolicyNode::And(children) => {
            for child in children {
                if !evaluate(child, identity, scope, cache)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        PolicyNode::Or(children) => {
            for child in children {
                if evaluate(child, identity, scope, cache)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        PolicyNode::Not(child) => Ok(!evaluate(child, identity, scope, cache)?),
    }
}

/// The protected fields of the composed ERP schema.
///
/// Everything not listed here is served default-permit; the subgraphs receive
/// the unmodified `authorization` header and enforce their own checks.
pub fn default_policies() -> PolicySet {
    let mut set = PolicySet::new();

    set.register(
        "Query.sensitiveData",
        PolicyNode::and(vec![authenticated(), has_role("ADMIN")]),
    );
    set.register(
        "Query.financialData",
        PolicyNode::and(vec![
            authenticated(),
            PolicyNode::or(vec![has_role("FINANCE_MANAGER"), has_role("ADMIN")]),
        ]),
    );
    set.register(
        "Query.hrData",
        PolicyNode::and(vec![
            authenticated(),
            PolicyNode::or(vec![has_role("HR_MANAGER"), has_role("ADMIN")]),
        ]),
    );
    set.register(
        "Mutation.createUser",
        PolicyNode::and(vec![authenticated(), has_role("ADMIN")]),
    );
    set.register(
        "Mutation.updateFinancialRecord",
        PolicyNode::and(vec![authenticated(), has_role("FINANCE_MANAGER")]),
    );
    set.register(
        "Mutation.processPayroll",
        PolicyNode::and(vec![authenticated(), has_role("HR_MANAGER")]),
    );

    set
}
