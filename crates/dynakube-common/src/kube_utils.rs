//! Shared Kubernetes helpers using kube-rs
//!
//! Label-selector evaluation, secret data access, node readiness and the
//! optimistic-concurrency retry used by every read-modify-write in the
//! operator.

use std::collections::BTreeMap;
use std::future::Future;

use k8s_openapi::api::core::v1::{Node, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::debug;

use crate::Error;

/// Kubernetes condition status meaning "true"
pub const STATUS_TRUE: &str = "True";

/// Kubernetes condition status meaning "unknown"
pub const STATUS_UNKNOWN: &str = "Unknown";

/// Operators accepted in `matchExpressions`
pub const SELECTOR_OPERATORS: [&str; 4] = ["In", "NotIn", "Exists", "DoesNotExist"];

// =============================================================================
// Label selectors
// =============================================================================

/// Evaluate a label selector against a label set.
///
/// An empty selector (no `matchLabels`, no `matchExpressions`) matches
/// everything. Unknown operators never match.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .as_ref()
        .map(|wanted| wanted.iter().all(|(k, v)| labels.get(k) == Some(v)))
        .unwrap_or(true);

    labels_match
        && selector
            .match_expressions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .all(|req| requirement_matches(req, labels))
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    let current = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => current.is_some_and(|v| values.contains(v)),
        "NotIn" => current.is_none_or(|v| !values.contains(v)),
        "Exists" => current.is_some(),
        "DoesNotExist" => current.is_none(),
        _ => false,
    }
}

/// Check that every expression of a selector uses a known operator and
/// carries values exactly when the operator needs them.
pub fn validate_selector(selector: &LabelSelector) -> Result<(), String> {
    for req in selector.match_expressions.as_deref().unwrap_or_default() {
        let has_values = req.values.as_ref().is_some_and(|v| !v.is_empty());
        match req.operator.as_str() {
            "In" | "NotIn" if !has_values => {
                return Err(format!(
                    "operator {} on key '{}' requires values",
                    req.operator, req.key
                ));
            }
            "Exists" | "DoesNotExist" if has_values => {
                return Err(format!(
                    "operator {} on key '{}' must not have values",
                    req.operator, req.key
                ));
            }
            op if !SELECTOR_OPERATORS.contains(&op) => {
                return Err(format!("unknown operator '{}' on key '{}'", op, req.key));
            }
            _ => {}
        }
    }
    Ok(())
}

// =============================================================================
// Secrets
// =============================================================================

/// Get a secret field as UTF-8 text, trimmed of surrounding whitespace.
///
/// Looks in `data` first, then `stringData`.
pub fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(bytes.0.clone())
            .ok()
            .map(|s| s.trim().to_string());
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|s| s.trim().to_string())
}

/// Raw bytes of a secret field, if present
pub fn secret_bytes<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.as_slice())
}

/// Build a `data` map from owned byte values
pub fn secret_data(entries: BTreeMap<String, Vec<u8>>) -> BTreeMap<String, ByteString> {
    entries
        .into_iter()
        .map(|(k, v)| (k, ByteString(v)))
        .collect()
}

// =============================================================================
// Nodes
// =============================================================================

/// Status of the node's `Ready` condition, if reported
pub fn node_ready_status(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status.as_str())
}

/// True when the node's `Ready` condition is `Unknown` (node unreachable)
pub fn node_state_unknown(node: &Node) -> bool {
    node_ready_status(node) == Some(STATUS_UNKNOWN)
}

// =============================================================================
// Optimistic concurrency
// =============================================================================

/// Run a read-modify-write, retrying once if the API server reports a
/// resourceVersion conflict.
///
/// The closure must re-read the object on every call. A second conflict is
/// returned to the caller, which defers to the next reconcile.
pub async fn retry_on_conflict_once<F, Fut, T>(operation: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    match op().await {
        Err(e) if e.is_resource_version_conflict() => {
            debug!(operation, "resourceVersion conflict, retrying once");
            op().await
        }
        other => other,
    }
}

/// Patch the status sub-resource of a namespaced resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
