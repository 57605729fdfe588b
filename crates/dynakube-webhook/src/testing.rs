//! Test doubles shared by the webhook tests

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, Namespace, Node, ObjectReference, Pod, PodSpec, Secret,
};
use kube::api::{DynamicObject, ObjectMeta};
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use kube::runtime::events::EventType;
use mockall::mock;

use dynakube_common::crd::DynaKube;
use dynakube_common::{Error, EventPublisher};
use dynakube_injection::{InjectionKubeClient, NamespaceMapper, SecretGenerator};

use crate::kube_client::MockWebhookKubeClient;
use crate::pod::{IngestEndpoint, InjectionParts, PodInjector};
use crate::workload::WorkloadInfo;
use crate::{WebhookConfig, WebhookState};

pub const OPERATOR_NS: &str = "dynatrace";

mock! {
    pub Secrets {}

    #[async_trait]
    impl SecretGenerator for Secrets {
        async fn generate_for_namespace(&self, dk: &DynaKube, namespace: &str) -> Result<bool, Error>;
    }
}

mock! {
    pub InjectionKube {}

    #[async_trait]
    impl InjectionKubeClient for InjectionKube {
        async fn list_namespaces(&self) -> Result<Vec<Namespace>, Error>;
        async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;
        async fn patch_namespace_instance(
            &self,
            name: &str,
            instance: Option<String>,
            resource_version: Option<String>,
        ) -> Result<(), Error>;
        async fn list_dynakubes(&self, namespace: &str) -> Result<Vec<DynaKube>, Error>;
        async fn get_dynakube(&self, name: &str, namespace: &str) -> Result<Option<DynaKube>, Error>;
        async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;
        async fn list_instance_secrets(&self, instance: &str) -> Result<Vec<Secret>, Error>;
        async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;
        async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;
        async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error>;
        async fn get_config_map(&self, name: &str, namespace: &str) -> Result<Option<ConfigMap>, Error>;
        async fn list_nodes(&self) -> Result<Vec<Node>, Error>;
        async fn kube_system_uid(&self) -> Result<String, Error>;
        async fn daemonset_exists(&self, name: &str, namespace: &str) -> Result<bool, Error>;
    }
}

/// Records `(object name, reason)` of every published event
#[derive(Clone, Default)]
pub struct RecordedEvents(Arc<Mutex<Vec<(String, String)>>>);

impl RecordedEvents {
    pub fn reasons_for(&self, name: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordedEvents {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        _type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.0
            .lock()
            .unwrap()
            .push((resource_ref.name.clone().unwrap_or_default(), reason.to_string()));
    }
}

/// DynaKube `dk` in the operator namespace with the given `oneAgent` block
pub fn dynakube(one_agent: &str, flags: &[(&str, &str)]) -> DynaKube {
    let yaml = format!(
        "apiVersion: dynatrace.com/v1beta1\nkind: DynaKube\nmetadata:\n  name: dk\n  namespace: {OPERATOR_NS}\nspec:\n  apiUrl: https://t.example/api\n  oneAgent:\n    {one_agent}\n"
    );
    let mut dk: DynaKube = serde_yaml::from_str(&yaml).unwrap();
    dk.spec.feature_flags = flags
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    dk
}

/// Webhook state over the given doubles
pub fn state(
    kube: MockWebhookKubeClient,
    secrets: MockSecrets,
    injection: MockInjectionKube,
    events: RecordedEvents,
) -> WebhookState {
    WebhookState {
        config: WebhookConfig {
            operator_namespace: OPERATOR_NS.to_string(),
            installer_image: "installer:1".to_string(),
            cluster_id: "cluster-uid".to_string(),
            ..Default::default()
        },
        kube: Arc::new(kube),
        secrets: Arc::new(secrets),
        mapper: Arc::new(NamespaceMapper::new(Arc::new(injection), OPERATOR_NS)),
        events: Arc::new(events),
    }
}

/// Admission request for `object` of `kind`/`resource` in `namespace`
pub fn admission_request(
    object: serde_json::Value,
    kind: &str,
    resource: &str,
    namespace: Option<&str>,
) -> AdmissionRequest<DynamicObject> {
    let review: AdmissionReview<DynamicObject> = serde_json::from_value(admission_review(
        object, kind, resource, namespace,
    ))
    .unwrap();
    review.try_into().unwrap()
}

/// Raw admission review JSON
pub fn admission_review(
    object: serde_json::Value,
    kind: &str,
    resource: &str,
    namespace: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "", "version": "v1", "kind": kind},
            "resource": {"group": "", "version": "v1", "resource": resource},
            "name": "",
            "namespace": namespace,
            "operation": "CREATE",
            "userInfo": {"username": "system:serviceaccount:kube-system:replicaset-controller"},
            "object": object,
            "dryRun": false
        }
    })
}

/// Pod `p-xyz12` with the given `(name, image)` containers
pub fn pod_with(containers: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("p-xyz12".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: containers
                .iter()
                .map(|(name, image)| Container {
                    name: name.to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Injector applying both parts with a resolved Deployment workload
pub fn injector<'a>(dk: &'a DynaKube, config: &'a WebhookConfig) -> PodInjector<'a> {
    PodInjector {
        dynakube: dk,
        config,
        parts: InjectionParts {
            oneagent: true,
            enrichment: true,
        },
        workload: Some(WorkloadInfo {
            kind: "Deployment".to_string(),
            name: "web".to_string(),
        }),
        ingest: IngestEndpoint {
            url: "https://t.example/api/v2/metrics/ingest".to_string(),
            token: "t1".to_string(),
        },
        has_custom_certs: false,
    }
}
