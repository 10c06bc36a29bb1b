// ============================================================================
// Query Planning & Result Merging
// ============================================================================
//
// The planner decomposes one inbound operation into per-subgraph
// sub-requests: top-level fields are grouped by owning service, each group is
// reassembled into a standalone operation (variable definitions pruned to the
// ones that group actually uses), and fields whose owner is known-unavailable
// become planned failures instead of wire calls.
//
// The merger joins the dispatched results back into one response shaped like
// the original operation. A failed sub-request attaches errors to the fields
// it owned; sibling fields from healthy subgraphs still carry data. A
// non-nullable field's failure escalates to the operation root, nulling
// `data` while keeping the errors array (GraphQL null propagation).
//
// ============================================================================

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::dispatch::{SubRequest, SubResponse};
use crate::error::{GatewayError, GatewayResult};
use crate::query::{Field, Operation, OperationKind};
use crate::registry::RegistrySnapshot;

/// A field that failed before or during dispatch, with its propagation mode.
#[derive(Debug)]
pub struct FieldFailure {
    pub field_key: String,
    pub error: GatewayError,
    pub nullable: bool,
    /// Authorization denials leave the field out of `data` entirely instead
    /// of writing an explicit null, so a denied non-nullable field does not
    /// null out healthy siblings.
    pub omit: bool,
}

#[derive(Debug)]
pub struct QueryPlan {
    pub sub_requests: Vec<SubRequest>,
    /// Failures decided at planning time (owner marked unavailable).
    pub planned_failures: Vec<FieldFailure>,
    /// Response keys of every requested top-level field, in operation order.
    pub response_keys: Vec<String>,
    /// Response key → nullable flag from the composed schema.
    nullability: HashMap<String, bool>,
}

impl QueryPlan {
    pub fn is_nullable(&self, response_key: &str) -> bool {
        self.nullability.get(response_key).copied().unwrap_or(true)
    }
}

/// Decompose `operation` against the current registry snapshot.
///
/// Fields unknown to the composed schema fail the whole operation as a
/// validation error; fields owned by an unavailable subgraph become planned
/// field-scoped failures.
pub fn plan_operation(
    operation: &Operation,
    snapshot: &RegistrySnapshot,
    variables: Option<&Value>,
) -> GatewayResult<QueryPlan> {
    let parent = match operation.kind {
        OperationKind::Query => "Query",
        OperationKind::Mutation => "Mutation",
        OperationKind::Subscription => {
            return Err(GatewayError::validation(
                "subscriptions require a streaming transport and are not served by this endpoint",
            ))
        }
    };

    let mut groups: BTreeMap<String, Vec<&Field>> = BTreeMap::new();
    let mut planned_failures = Vec::new();
    let mut response_keys = Vec::new();
    let mut nullability = HashMap::new();

    for field in &operation.fields {
        let key = format!("{}.{}", parent, field.name);
        let route = snapshot.resolve(&key).ok_or_else(|| {
            GatewayError::validation(format!(
                "field {} is not part of the composed schema",
                key
            ))
        })?;

        let response_key = field.response_key().to_string();
        response_keys.push(response_key.clone());
        nullability.insert(response_key.clone(), route.nullable);

        let endpoint_up = snapshot
            .endpoint(&route.service)
            .map(|e| e.available)
            .unwrap_or(false);

        if route.available && endpoint_up {
            groups.entry(route.service.clone()).or_default().push(field);
        } else {
            planned_failures.push(FieldFailure {
                field_key: response_key,
                error: GatewayError::Upstream {
                    service: route.service.clone(),
                    reason: "subgraph is currently unavailable".to_string(),
                },
                nullable: route.nullable,
                omit: false,
            });
        }
    }

    let sub_requests = groups
        .into_iter()
        .map(|(service, fields)| {
            let url = snapshot
                .endpoint(&service)
                .map(|e| e.url.clone())
                .unwrap_or_default();
            build_sub_request(operation, service, url, &fields, variables)
        })
        .collect();

    Ok(QueryPlan {
        sub_requests,
        planned_failures,
        response_keys,
        nullability,
    })
}

/// Reassemble the sub-operation text for one service's field group.
fn build_sub_request(
    operation: &Operation,
    service: String,
    url: String,
    fields: &[&Field],
    variables: Option<&Value>,
) -> SubRequest {
    let sources: Vec<&str> = fields.iter().map(|f| f.source.as_str()).collect();
    let field_keys: Vec<String> = fields
        .iter()
        .map(|f| f.response_key().to_string())
        .collect();

    let var_defs = operation
        .variable_defs
        .as_deref()
        .map(|defs| prune_variable_defs(defs, &sources))
        .filter(|d| !d.is_empty());

    let mut query = String::from(operation.kind.as_str());
    if let Some(name) = &operation.name {
        query.push(' ');
        query.push_str(name);
    }
    if let Some(defs) = &var_defs {
        query.push_str(defs);
    }
    query.push_str(" { ");
    query.push_str(&sources.join(" "));
    query.push_str(" }");

    let variables = variables
        .and_then(Value::as_object)
        .map(|vars| {
            let kept: Map<String, Value> = vars
                .iter()
                .filter(|(name, _)| sources.iter().any(|s| uses_variable(s, name)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(kept)
        })
        .filter(|v| v.as_object().map(|o| !o.is_empty()).unwrap_or(false));

    SubRequest {
        service,
        url,
        query,
        operation_name: operation.name.clone(),
        variables,
        field_keys,
    }
}

/// Keep only the variable definitions referenced by the given field sources.
/// Input is the raw `($a: Int, $b: [ID!] = [])` text from the parser.
fn prune_variable_defs(defs: &str, sources: &[&str]) -> String {
    let inner = defs
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')');

    let kept: Vec<&str> = split_top_level(inner)
        .into_iter()
        .filter(|def| {
            variable_name(def)
                .map(|name| sources.iter().any(|s| uses_variable(s, name)))
                .unwrap_or(false)
        })
        .collect();

    if kept.is_empty() {
        String::new()
    } else {
        format!("({})", kept.join(", "))
    }
}

/// Split on commas that are not nested inside brackets, braces, or parens.
fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                let part = input[start..i].trim();
                if !part.is_empty() {
                    parts.push(part);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = input[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

/// Leading `$name` of one variable definition.
fn variable_name(def: &str) -> Option<&str> {
    let def = def.trim();
    let rest = def.strip_prefix('$')?;
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

/// Whether `source` references `$name` (exact, not a prefix of a longer name).
fn uses_variable(source: &str, name: &str) -> bool {
    let needle = format!("${}", name);
    let mut search = source;
    while let Some(idx) = search.find(&needle) {
        let after = &search[idx + needle.len()..];
        if !after
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric() || c == '_')
            .unwrap_or(false)
        {
            return true;
        }
        search = &search[idx + needle.len()..];
    }
    false
}

/// Merge dispatched results and field failures into one GraphQL response.
///
/// `results` aligns with `plan.sub_requests`. Extra failures (authorization
/// denials decided upstream of dispatch) are passed in `failures`.
pub fn merge_results(
    plan: &QueryPlan,
    results: Vec<GatewayResult<SubResponse>>,
    failures: Vec<FieldFailure>,
    correlation_id: &str,
    expose_detail: bool,
) -> (Value, Vec<Value>) {
    let mut data = Map::new();
    for key in &plan.response_keys {
        data.insert(key.clone(), Value::Null);
    }
    let mut errors = Vec::new();
    let mut root_nulled = false;

    let record_failure = |failure: &FieldFailure,
                          data: &mut Map<String, Value>,
                          errors: &mut Vec<Value>,
                          root_nulled: &mut bool| {
        let mut error = failure
            .error
            .to_graphql_error(correlation_id, expose_detail);
        if let Some(obj) = error.as_object_mut() {
            obj.insert(
                "path".to_string(),
                Value::Array(vec![Value::String(failure.field_key.clone())]),
            );
        }
        errors.push(error);
        if failure.omit {
            data.remove(&failure.field_key);
        } else {
            data.insert(failure.field_key.clone(), Value::Null);
            if !failure.nullable {
                *root_nulled = true;
            }
        }
    };

    for failure in plan.planned_failures.iter().chain(failures.iter()) {
        record_failure(failure, &mut data, &mut errors, &mut root_nulled);
    }

    for (request, result) in plan.sub_requests.iter().zip(results) {
        match result {
            Ok(response) => {
                let sub_data = response.data.unwrap_or(Value::Null);
                for key in &request.field_keys {
                    let value = sub_data.get(key).cloned().unwrap_or(Value::Null);
                    if value.is_null() && !plan.is_nullable(key) && !response.errors.is_empty() {
                        root_nulled = true;
                    }
                    data.insert(key.clone(), value);
                }
                errors.extend(response.errors);
            }
            Err(error) => {
                for key in &request.field_keys {
                    let failure = FieldFailure {
                        field_key: key.clone(),
                        error: clone_upstream(&error, &request.service),
                        nullable: plan.is_nullable(key),
                        omit: false,
                    };
                    record_failure(&failure, &mut data, &mut errors, &mut root_nulled);
                }
            }
        }
    }

    let data = if root_nulled {
        Value::Null
    } else {
        Value::Object(data)
    };
    (data, errors)
}

/// A sub-request error applies to every field the sub-request owned; the
/// original error cannot be cloned, so rebuild an equivalent per field.
fn clone_upstream(error: &GatewayError, service: &str) -> GatewayError {
    match error {
        GatewayError::UpstreamTimeout { .. } => GatewayError::UpstreamTimeout {
            service: service.to_string(),
        },
        other => GatewayError::Upstream {
            service: service.to_string(),
            reason: other.user_message(),
        },
    }
}
