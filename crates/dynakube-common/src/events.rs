//! Kubernetes Event recording for the DynaKube controllers and webhooks.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation or an
//! admission response.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

use crate::crd::{DYNAKUBE_API_VERSION, DYNAKUBE_KIND};

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Inject")
    /// * `action` - What action was taken (e.g. "Mutate")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given component name.
    ///
    /// The name appears as the "reportingComponent" on Events
    /// (e.g. "dynakube-controller", "dynakube-webhook").
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Object reference for a DynaKube that may not exist.
///
/// Used to attach events to the sentinel instance when a namespace points at
/// a missing DynaKube, so the problem shows up next to the other DynaKube
/// events in the operator namespace.
pub fn dynakube_reference(name: &str, namespace: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(DYNAKUBE_API_VERSION.to_string()),
        kind: Some(DYNAKUBE_KIND.to_string()),
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Two DynaKubes claim the same namespace
    pub const NAMESPACE_CONFLICT: &str = "NamespaceConflict";
    /// Init and endpoint secrets were written
    pub const SECRETS_GENERATED: &str = "SecretsGenerated";
    /// DynaKube spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A pod was injected
    pub const INJECT: &str = "Inject";
    /// Containers were added to an already injected pod
    pub const UPDATE_POD: &str = "UpdatePod";
    /// A namespace references a DynaKube that does not exist
    pub const MISSING_DYNAKUBE: &str = "MissingDynakube";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Admission mutation
    pub const MUTATE: &str = "Mutate";
}

/// Name of the placeholder DynaKube that receives events about missing instances
pub const PLACEHOLDER_DYNAKUBE: &str = "placeholder";
