//! Namespace labelling webhook
//!
//! Keeps the instance label of a namespace in line with the DynaKube
//! selectors the moment the namespace is created or relabelled, so pods
//! created right after their namespace are already injected.

use std::sync::Arc;

use axum::{extract::State, Json};
use json_patch::{PatchOperation, RemoveOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use dynakube_common::{INSTANCE_LABEL, UPDATED_VIA_OPERATOR_ANNOTATION};
use dynakube_injection::instance_of;

use crate::error::WebhookError;
use crate::WebhookState;

/// Handle mutating admission review for namespaces
pub async fn namespace_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate_namespace(&state, &req).await;
    Json(response.into_review())
}

/// Process a single namespace admission request
pub async fn mutate_namespace(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    match label(state, request).await {
        Ok(None) => AdmissionResponse::from(request),
        Ok(Some(patch)) => match AdmissionResponse::from(request).with_patch(patch) {
            Ok(response) => response,
            Err(e) => {
                error!(uid = %request.uid, error = %e, "Failed to serialize patch");
                AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
            }
        },
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "denying namespace");
            AdmissionResponse::from(request).deny(e.to_string())
        }
    }
}

/// Patch dropping the marker annotation the operator sets on its own writes
fn drop_marker() -> json_patch::Patch {
    json_patch::Patch(vec![PatchOperation::Remove(RemoveOperation {
        path: PointerBuf::from_tokens(["metadata", "annotations", UPDATED_VIA_OPERATOR_ANNOTATION]),
    })])
}

async fn label(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<Option<json_patch::Patch>, WebhookError> {
    let Some(object) = request.object.as_ref() else {
        return Ok(None);
    };
    let ns: Namespace = match serde_json::to_value(object).and_then(serde_json::from_value) {
        Ok(ns) => ns,
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "could not decode namespace, allowing unchanged");
            return Ok(None);
        }
    };
    let name = ns.name_any();

    if ns.annotations().contains_key(UPDATED_VIA_OPERATOR_ANNOTATION) {
        debug!(namespace = %name, "label written by the operator, keeping it");
        return Ok(Some(drop_marker()));
    }
    if name == state.config.operator_namespace {
        return Ok(None);
    }

    let target = match state.mapper.map_from_namespace(&ns).await {
        Ok(target) => target,
        Err(e) if e.is_conflict() => {
            warn!(namespace = %name, error = %e, "namespace claimed by several DynaKubes, leaving label as is");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if instance_of(&ns) == target.as_deref() {
        return Ok(None);
    }

    let mut labelled = ns.clone();
    let labels = labelled.labels_mut();
    match &target {
        Some(dk) => {
            labels.insert(INSTANCE_LABEL.to_string(), dk.clone());
        }
        None => {
            labels.remove(INSTANCE_LABEL);
        }
    }
    info!(namespace = %name, instance = ?target, "updating namespace instance label");

    let patch = json_patch::diff(&serde_json::to_value(&ns)?, &serde_json::to_value(&labelled)?);
    Ok((!patch.0.is_empty()).then_some(patch))
}
