//! Pod mutation webhook
//!
//! Handles AdmissionReview requests for pods. A pod in a namespace labelled
//! for a DynaKube with application injection gets the install-oneagent init
//! container and the mounts and env of the parts that apply to it. Pods that
//! carry the injected annotations only get containers added since then.
//!
//! Only a missing DynaKube, unavailable secrets or API errors deny a pod;
//! everything else admits it, mutated or unchanged.

mod inject;
mod reinvoke;

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use dynakube_common::crd::DynaKube;
use dynakube_common::events::{actions, dynakube_reference, reasons, PLACEHOLDER_DYNAKUBE};
use dynakube_common::kube_utils::{secret_bytes, secret_string};
use dynakube_common::metrics::{ADMISSION_DENIALS, POD_INJECTIONS, POD_REINVOCATIONS};
use dynakube_common::{
    annotations, ENDPOINT_PROPERTIES_FIELD, ENDPOINT_SECRET_NAME, INIT_SECRET_AG_CERTS_FIELD,
    INIT_SECRET_NAME, INIT_SECRET_TRUSTED_CAS_FIELD,
};
use dynakube_injection::instance_of;

use crate::error::WebhookError;
use crate::workload::{resolve_workload, WorkloadInfo};
use crate::WebhookState;

pub(crate) use inject::annotation;
pub use inject::{
    add_container_entry, base_pod_name, has_env, has_mount, listed_containers, IngestEndpoint,
    InjectionParts, PodInjector, PodSettings, AGENT_CONF_VOLUME, BIN_VOLUME, CONFIG_VOLUME,
    ENDPOINT_VOLUME, ENRICHMENT_VOLUME, INSTALL_CONTAINER_NAME, SHARE_VOLUME,
};

fn bool_annotation(pod: &Pod, key: &str) -> Option<bool> {
    annotation(pod, key).map(|v| v.eq_ignore_ascii_case("true"))
}

/// Parts of the injection `pod` opts into under `dk`.
///
/// `dynatrace.com/inject=false` turns everything off. Otherwise each part
/// follows its own annotation, defaulting to `dynatrace.com/inject` and then
/// to the DynaKube's automatic-injection flag. Enrichment additionally needs
/// the metadata-enrichment flag.
pub fn injection_parts(pod: &Pod, dk: &DynaKube) -> InjectionParts {
    let flags = dk.feature_flags();
    let global = bool_annotation(pod, annotations::INJECT);
    if global == Some(false) {
        return InjectionParts::default();
    }
    let default = global.unwrap_or_else(|| flags.automatic_injection());
    InjectionParts {
        oneagent: bool_annotation(pod, annotations::ONEAGENT_INJECT).unwrap_or(default),
        enrichment: flags.metadata_enrichment()
            && bool_annotation(pod, annotations::DATA_INGEST_INJECT).unwrap_or(default),
    }
}

/// Parts already injected into `pod`, from its annotations
pub fn injected_parts(pod: &Pod) -> InjectionParts {
    InjectionParts {
        oneagent: bool_annotation(pod, annotations::ONEAGENT_INJECTED) == Some(true),
        enrichment: bool_annotation(pod, annotations::DATA_INGEST_INJECTED) == Some(true),
    }
}

/// Whether `pod` went through the webhook before
pub fn is_injected(pod: &Pod) -> bool {
    injected_parts(pod).any()
}

/// Handle mutating admission review for pods
pub async fn mutate_handler(
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

    let response = mutate_pod(&state, &req).await;
    Json(response.into_review())
}

/// Process a single pod admission request
pub async fn mutate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    match admit(state, request).await {
        Ok(None) => AdmissionResponse::from(request),
        Ok(Some(patch)) => match AdmissionResponse::from(request).with_patch(patch) {
            Ok(response) => response,
            Err(e) => {
                error!(uid = %request.uid, error = %e, "Failed to serialize patch");
                AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
            }
        },
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "denying pod");
            ADMISSION_DENIALS.add(1, &[KeyValue::new("reason", e.denial_reason())]);
            AdmissionResponse::from(request).deny(e.to_string())
        }
    }
}

/// Init secret and, when enrichment applies, the endpoint secret
struct NamespaceSecrets {
    init: Secret,
    endpoint: Option<Secret>,
}

impl NamespaceSecrets {
    fn has_custom_certs(&self) -> bool {
        [INIT_SECRET_TRUSTED_CAS_FIELD, INIT_SECRET_AG_CERTS_FIELD]
            .iter()
            .any(|key| secret_bytes(&self.init, key).is_some_and(|b| !b.is_empty()))
    }

    fn ingest(&self) -> IngestEndpoint {
        self.endpoint
            .as_ref()
            .and_then(|s| secret_string(s, ENDPOINT_PROPERTIES_FIELD))
            .map(|p| IngestEndpoint::parse(&p))
            .unwrap_or_default()
    }
}

async fn fetch_secrets(
    state: &WebhookState,
    namespace: &str,
    enrichment: bool,
) -> Result<Option<NamespaceSecrets>, WebhookError> {
    let Some(init) = state.kube.get_secret(INIT_SECRET_NAME, namespace).await? else {
        return Ok(None);
    };
    if !enrichment {
        return Ok(Some(NamespaceSecrets {
            init,
            endpoint: None,
        }));
    }
    Ok(state
        .kube
        .get_secret(ENDPOINT_SECRET_NAME, namespace)
        .await?
        .map(|endpoint| NamespaceSecrets {
            init,
            endpoint: Some(endpoint),
        }))
}

/// Read the namespace secrets, generating them when a pod races ahead of
/// the DynaKube reconcile
async fn ensure_secrets(
    state: &WebhookState,
    dk: &DynaKube,
    namespace: &str,
    enrichment: bool,
) -> Result<NamespaceSecrets, WebhookError> {
    if let Some(secrets) = fetch_secrets(state, namespace, enrichment).await? {
        return Ok(secrets);
    }

    info!(namespace, dynakube = %dk.name_any(), "secrets missing, generating");
    state
        .secrets
        .generate_for_namespace(dk, namespace)
        .await
        .map_err(|source| WebhookError::SecretUnavailable {
            namespace: namespace.to_string(),
            source,
        })?;

    fetch_secrets(state, namespace, enrichment)
        .await?
        .ok_or_else(|| WebhookError::SecretUnavailable {
            namespace: namespace.to_string(),
            source: dynakube_common::Error::not_found("Secret", INIT_SECRET_NAME),
        })
}

fn decode_pod(request: &AdmissionRequest<DynamicObject>) -> Option<Pod> {
    let object = request.object.as_ref()?;
    match serde_json::to_value(object).and_then(serde_json::from_value::<Pod>) {
        Ok(pod) => Some(pod),
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "could not decode pod, allowing unchanged");
            None
        }
    }
}

/// Decide on one pod and build the patch, if any
async fn admit(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<Option<json_patch::Patch>, WebhookError> {
    let Some(original) = decode_pod(request) else {
        return Ok(None);
    };
    let Some(namespace) = request
        .namespace
        .clone()
        .or_else(|| original.metadata.namespace.clone())
    else {
        debug!(uid = %request.uid, "pod without namespace, allowing unchanged");
        return Ok(None);
    };
    if namespace == state.config.operator_namespace {
        return Ok(None);
    }

    let Some(ns) = state.kube.get_namespace(&namespace).await? else {
        debug!(namespace = %namespace, "namespace not found, allowing unchanged");
        return Ok(None);
    };
    let Some(instance) = instance_of(&ns).map(str::to_string) else {
        return Ok(None);
    };

    let Some(dk) = state
        .kube
        .get_dynakube(&instance, &state.config.operator_namespace)
        .await?
    else {
        let err = WebhookError::MissingDynakube {
            namespace: namespace.clone(),
            dynakube: instance,
        };
        state
            .events
            .publish(
                &dynakube_reference(PLACEHOLDER_DYNAKUBE, &state.config.operator_namespace),
                EventType::Warning,
                reasons::MISSING_DYNAKUBE,
                actions::MUTATE,
                Some(err.to_string()),
            )
            .await;
        return Err(err);
    };
    if !dk.needs_app_injection() {
        return Ok(None);
    }

    let parts = injection_parts(&original, &dk);
    if !parts.any() {
        debug!(namespace = %namespace, pod = %base_pod_name(&original), "pod opted out of injection");
        return Ok(None);
    }

    let already = injected_parts(&original);
    let mut pod = original.clone();
    let dk_name = dk.name_any();
    let dk_ref = dynakube_reference(&dk_name, &state.config.operator_namespace);

    if already.any() {
        if !dk.feature_flags().webhook_reinvocation_policy() {
            return Ok(None);
        }
        let parts = InjectionParts {
            oneagent: parts.oneagent && already.oneagent,
            enrichment: parts.enrichment && already.enrichment,
        };
        if !parts.any() {
            return Ok(None);
        }
        let secrets = ensure_secrets(state, &dk, &namespace, parts.enrichment).await?;
        let injector = PodInjector {
            dynakube: &dk,
            config: &state.config,
            parts,
            workload: None,
            ingest: secrets.ingest(),
            has_custom_certs: secrets.has_custom_certs(),
        };
        if !injector.reinvoke(&mut pod) {
            return Ok(None);
        }
        state
            .events
            .publish(
                &dk_ref,
                EventType::Normal,
                reasons::UPDATE_POD,
                actions::MUTATE,
                Some(format!(
                    "Updating pod {} in namespace {namespace} with missing containers",
                    base_pod_name(&pod)
                )),
            )
            .await;
        POD_REINVOCATIONS.add(1, &[KeyValue::new("dynakube", dk_name)]);
    } else {
        let secrets = ensure_secrets(state, &dk, &namespace, parts.enrichment).await?;
        let workload = if parts.enrichment {
            Some(
                resolve_workload(state.kube.as_ref(), &original, &namespace)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(namespace = %namespace, error = %e, "owner lookup failed, workload unknown");
                        WorkloadInfo::unknown()
                    }),
            )
        } else {
            None
        };
        let injector = PodInjector {
            dynakube: &dk,
            config: &state.config,
            parts,
            workload,
            ingest: secrets.ingest(),
            has_custom_certs: secrets.has_custom_certs(),
        };
        injector.inject(&mut pod);

        let base = base_pod_name(&pod);
        info!(
            dynakube = %dk_name,
            namespace = %namespace,
            pod = %base,
            oneagent = parts.oneagent,
            enrichment = parts.enrichment,
            "injecting pod"
        );
        state
            .events
            .publish(
                &dk_ref,
                EventType::Normal,
                reasons::INJECT,
                actions::MUTATE,
                Some(format!(
                    "Injecting the necessary info into pod {base} in namespace {namespace}"
                )),
            )
            .await;
        POD_INJECTIONS.add(
            1,
            &[
                KeyValue::new("dynakube", dk_name),
                KeyValue::new("namespace", namespace.clone()),
            ],
        );
    }

    let patch = json_patch::diff(&serde_json::to_value(&original)?, &serde_json::to_value(&pod)?);
    Ok((!patch.0.is_empty()).then_some(patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use dynakube_common::{env, Error, INSTANCE_LABEL, INIT_SECRET_CONFIG_FIELD};
    use k8s_openapi::api::core::v1::{Container, Namespace};
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use mockall::predicate::{always, eq};

    use crate::kube_client::MockWebhookKubeClient;
    use crate::testing::{
        admission_request, dynakube, pod_with, state, MockInjectionKube, MockSecrets,
        RecordedEvents, OPERATOR_NS,
    };

    const APP_NS: &str = "app";

    fn labelled_namespace(instance: Option<&str>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(APP_NS.to_string()),
                labels: instance
                    .map(|i| BTreeMap::from([(INSTANCE_LABEL.to_string(), i.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn secret(name: &str, entries: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(APP_NS.to_string()),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn init_secret() -> Secret {
        secret(INIT_SECRET_NAME, &[(INIT_SECRET_CONFIG_FIELD, "{}")])
    }

    fn endpoint_secret() -> Secret {
        secret(
            ENDPOINT_SECRET_NAME,
            &[(
                ENDPOINT_PROPERTIES_FIELD,
                "DT_METRICS_INGEST_URL=https://t.example/api/v2/metrics/ingest\nDT_METRICS_INGEST_API_TOKEN=t1\n",
            )],
        )
    }

    /// Kube double for a namespace labelled `dk` with both secrets present
    fn cluster(dk: Option<DynaKube>) -> MockWebhookKubeClient {
        let mut kube = MockWebhookKubeClient::new();
        kube.expect_get_namespace()
            .with(eq(APP_NS))
            .returning(|_| Ok(Some(labelled_namespace(Some("dk")))));
        kube.expect_get_dynakube()
            .with(eq("dk"), eq(OPERATOR_NS))
            .returning(move |_, _| Ok(dk.clone()));
        kube.expect_get_secret()
            .with(eq(INIT_SECRET_NAME), eq(APP_NS))
            .returning(|_, _| Ok(Some(init_secret())));
        kube.expect_get_secret()
            .with(eq(ENDPOINT_SECRET_NAME), eq(APP_NS))
            .returning(|_, _| Ok(Some(endpoint_secret())));
        kube
    }

    fn webhook(kube: MockWebhookKubeClient, secrets: MockSecrets) -> (WebhookState, RecordedEvents) {
        let events = RecordedEvents::default();
        (
            state(kube, secrets, MockInjectionKube::new(), events.clone()),
            events,
        )
    }

    fn request_for(pod: &Pod, namespace: &str) -> AdmissionRequest<DynamicObject> {
        admission_request(serde_json::to_value(pod).unwrap(), "Pod", "pods", Some(namespace))
    }

    fn admitted(pod: &Pod, patch: &json_patch::Patch) -> Pod {
        let mut doc = serde_json::to_value(pod).unwrap();
        json_patch::patch(&mut doc, patch).unwrap();
        serde_json::from_value(doc).unwrap()
    }

    fn env_of<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    fn volume_names(pod: &Pod) -> Vec<String> {
        pod.spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .map(|v| v.iter().map(|v| v.name.clone()).collect())
            .unwrap_or_default()
    }

    fn install(pod: &Pod) -> &Container {
        pod.spec
            .as_ref()
            .and_then(|s| s.init_containers.as_ref())
            .and_then(|ics| ics.iter().find(|c| c.name == INSTALL_CONTAINER_NAME))
            .unwrap()
    }

    fn review_json(response: AdmissionResponse) -> serde_json::Value {
        serde_json::to_value(response.into_review()).unwrap()
    }

    #[test]
    fn global_opt_out_disables_every_part() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let mut pod = pod_with(&[("web", "alpine")]);
        pod.metadata.annotations = Some(BTreeMap::from([
            (annotations::INJECT.to_string(), "false".to_string()),
            (annotations::ONEAGENT_INJECT.to_string(), "true".to_string()),
        ]));
        assert!(!injection_parts(&pod, &dk).any());
    }

    #[test]
    fn parts_follow_their_own_annotations() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let mut pod = pod_with(&[("web", "alpine")]);
        assert_eq!(
            injection_parts(&pod, &dk),
            InjectionParts {
                oneagent: true,
                enrichment: true
            }
        );

        pod.metadata.annotations = Some(BTreeMap::from([(
            annotations::DATA_INGEST_INJECT.to_string(),
            "false".to_string(),
        )]));
        assert_eq!(
            injection_parts(&pod, &dk),
            InjectionParts {
                oneagent: true,
                enrichment: false
            }
        );
    }

    #[test]
    fn manual_injection_needs_opt_in() {
        let dk = dynakube(
            "applicationMonitoring: {}",
            &[("automatic-injection", "false")],
        );
        let mut pod = pod_with(&[("web", "alpine")]);
        assert!(!injection_parts(&pod, &dk).any());

        pod.metadata.annotations = Some(BTreeMap::from([(
            annotations::INJECT.to_string(),
            "true".to_string(),
        )]));
        assert!(injection_parts(&pod, &dk).oneagent);
    }

    #[test]
    fn enrichment_flag_disables_enrichment_only() {
        let dk = dynakube(
            "applicationMonitoring: {}",
            &[("metadata-enrichment", "false")],
        );
        let parts = injection_parts(&pod_with(&[("web", "alpine")]), &dk);
        assert!(parts.oneagent);
        assert!(!parts.enrichment);
    }

    /// Story: application monitoring without CSI downloads the code modules
    #[tokio::test]
    async fn story_installer_mode_injection() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let (state, events) = webhook(cluster(Some(dk)), MockSecrets::new());
        let pod = pod_with(&[("web", "alpine")]);

        let patch = admit(&state, &request_for(&pod, APP_NS))
            .await
            .unwrap()
            .expect("pod should be patched");
        let injected = admitted(&pod, &patch);

        assert_eq!(
            volume_names(&injected),
            vec![
                BIN_VOLUME,
                SHARE_VOLUME,
                CONFIG_VOLUME,
                ENDPOINT_VOLUME,
                ENRICHMENT_VOLUME
            ]
        );
        let bin = injected.spec.as_ref().unwrap().volumes.as_ref().unwrap()[0].clone();
        assert!(bin.empty_dir.is_some());

        let ic = install(&injected);
        assert_eq!(ic.image.as_deref(), Some("installer:1"));
        assert_eq!(env_of(ic, env::MODE), Some(env::MODE_INSTALLER));
        assert_eq!(env_of(ic, env::K8S_BASE_POD_NAME), Some("p"));
        assert_eq!(env_of(ic, env::K8S_CLUSTER_ID), Some("cluster-uid"));
        assert_eq!(env_of(ic, env::WORKLOAD_KIND), Some("Pod"));
        assert_eq!(env_of(ic, "CONTAINER_1_NAME"), Some("web"));

        let web = &injected.spec.as_ref().unwrap().containers[0];
        assert!(has_env(web, env::LD_PRELOAD));
        assert_eq!(
            env_of(web, "DT_METRICS_INGEST_URL"),
            Some("https://t.example/api/v2/metrics/ingest")
        );
        assert_eq!(env_of(web, "DT_METRICS_INGEST_API_TOKEN"), Some("t1"));
        assert!(is_injected(&injected));
        assert_eq!(events.reasons_for("dk"), vec![reasons::INJECT]);
    }

    /// Story: cloud-native full stack mounts the CSI volume
    #[tokio::test]
    async fn story_csi_provisioned_injection() {
        let dk = dynakube("cloudNativeFullStack: {}", &[]);
        let (state, _) = webhook(cluster(Some(dk)), MockSecrets::new());
        let pod = pod_with(&[("web", "alpine")]);

        let patch = admit(&state, &request_for(&pod, APP_NS))
            .await
            .unwrap()
            .unwrap();
        let injected = admitted(&pod, &patch);

        let bin = injected.spec.as_ref().unwrap().volumes.as_ref().unwrap()[0].clone();
        let csi = bin.csi.expect("bin volume should be CSI");
        assert_eq!(csi.driver, "csi.oneagent.dynatrace.com");
        assert_eq!(
            csi.volume_attributes.unwrap().get("dynakube").map(String::as_str),
            Some("dk")
        );
        assert_eq!(env_of(install(&injected), env::MODE), Some(env::MODE_PROVISIONED));
    }

    /// Story: a second admission of an injected pod only adds new containers
    #[tokio::test]
    async fn story_reinvocation_through_admission() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let (state, events) = webhook(cluster(Some(dk)), MockSecrets::new());
        let pod = pod_with(&[("web", "alpine")]);
        let patch = admit(&state, &request_for(&pod, APP_NS))
            .await
            .unwrap()
            .unwrap();
        let mut injected = admitted(&pod, &patch);

        assert!(admit(&state, &request_for(&injected, APP_NS))
            .await
            .unwrap()
            .is_none());

        injected.spec.as_mut().unwrap().containers.push(Container {
            name: "sidecar".to_string(),
            image: Some("nginx".to_string()),
            ..Default::default()
        });
        let patch = admit(&state, &request_for(&injected, APP_NS))
            .await
            .unwrap()
            .expect("sidecar should be injected");
        let updated = admitted(&injected, &patch);

        assert_eq!(env_of(install(&updated), "CONTAINER_2_NAME"), Some("sidecar"));
        assert_eq!(env_of(install(&updated), env::CONTAINERS_COUNT), Some("2"));
        assert_eq!(
            events.reasons_for("dk"),
            vec![reasons::INJECT, reasons::UPDATE_POD]
        );
    }

    #[tokio::test]
    async fn reinvocation_can_be_disabled() {
        let dk = dynakube(
            "applicationMonitoring: {}",
            &[("disable-webhook-reinvocation-policy", "true")],
        );
        let (state, _) = webhook(cluster(Some(dk)), MockSecrets::new());
        let pod = pod_with(&[("web", "alpine")]);
        let patch = admit(&state, &request_for(&pod, APP_NS))
            .await
            .unwrap()
            .unwrap();
        let mut injected = admitted(&pod, &patch);
        injected.spec.as_mut().unwrap().containers.push(Container {
            name: "sidecar".to_string(),
            ..Default::default()
        });

        assert!(admit(&state, &request_for(&injected, APP_NS))
            .await
            .unwrap()
            .is_none());
    }

    /// Story: a namespace pointing at a deleted DynaKube denies pods
    #[tokio::test]
    async fn story_missing_dynakube_denies() {
        let (state, events) = webhook(cluster(None), MockSecrets::new());
        let pod = pod_with(&[("web", "alpine")]);

        let review = review_json(mutate_pod(&state, &request_for(&pod, APP_NS)).await);

        assert_eq!(review["response"]["allowed"], false);
        assert_eq!(
            review["response"]["status"]["message"],
            "namespace 'app' is assigned to DynaKube instance 'dk' but it doesn't exist"
        );
        assert_eq!(
            events.reasons_for(PLACEHOLDER_DYNAKUBE),
            vec![reasons::MISSING_DYNAKUBE]
        );
    }

    #[tokio::test]
    async fn opted_out_pods_are_allowed_unchanged() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let (state, events) = webhook(cluster(Some(dk)), MockSecrets::new());
        let mut pod = pod_with(&[("web", "alpine")]);
        pod.metadata.annotations = Some(BTreeMap::from([(
            annotations::INJECT.to_string(),
            "false".to_string(),
        )]));

        let review = review_json(mutate_pod(&state, &request_for(&pod, APP_NS)).await);
        assert_eq!(review["response"]["allowed"], true);
        assert!(review["response"].get("patch").is_none());
        assert!(events.reasons_for("dk").is_empty());
    }

    #[tokio::test]
    async fn unlabelled_namespaces_are_skipped() {
        let mut kube = MockWebhookKubeClient::new();
        kube.expect_get_namespace()
            .returning(|_| Ok(Some(labelled_namespace(None))));
        let (state, _) = webhook(kube, MockSecrets::new());

        let pod = pod_with(&[("web", "alpine")]);
        assert!(admit(&state, &request_for(&pod, APP_NS))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn operator_namespace_is_never_injected() {
        let (state, _) = webhook(MockWebhookKubeClient::new(), MockSecrets::new());
        let pod = pod_with(&[("web", "alpine")]);
        assert!(admit(&state, &request_for(&pod, OPERATOR_NS))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn host_only_dynakubes_do_not_inject() {
        let dk = dynakube("hostMonitoring: {}", &[]);
        let (state, _) = webhook(cluster(Some(dk)), MockSecrets::new());
        let pod = pod_with(&[("web", "alpine")]);
        assert!(admit(&state, &request_for(&pod, APP_NS))
            .await
            .unwrap()
            .is_none());
    }

    fn cluster_without_secrets(dk: DynaKube, generated: Arc<std::sync::Mutex<bool>>) -> MockWebhookKubeClient {
        let mut kube = MockWebhookKubeClient::new();
        kube.expect_get_namespace()
            .returning(|_| Ok(Some(labelled_namespace(Some("dk")))));
        kube.expect_get_dynakube()
            .returning(move |_, _| Ok(Some(dk.clone())));
        kube.expect_get_secret().returning(move |name, _| {
            if !*generated.lock().unwrap() {
                return Ok(None);
            }
            Ok(Some(if name == INIT_SECRET_NAME {
                init_secret()
            } else {
                endpoint_secret()
            }))
        });
        kube
    }

    /// Story: a pod admitted before the first reconcile generates the secrets
    #[tokio::test]
    async fn story_secrets_generated_on_demand() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let generated = Arc::new(std::sync::Mutex::new(false));
        let kube = cluster_without_secrets(dk, generated.clone());
        let mut secrets = MockSecrets::new();
        secrets
            .expect_generate_for_namespace()
            .with(always(), eq(APP_NS))
            .times(1)
            .returning(move |_, _| {
                *generated.lock().unwrap() = true;
                Ok(true)
            });
        let (state, _) = webhook(kube, secrets);

        let pod = pod_with(&[("web", "alpine")]);
        assert!(admit(&state, &request_for(&pod, APP_NS))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn secret_generation_failure_denies() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let kube = cluster_without_secrets(dk, Arc::new(std::sync::Mutex::new(false)));
        let mut secrets = MockSecrets::new();
        secrets
            .expect_generate_for_namespace()
            .returning(|_, _| Err(Error::backend("tenant unreachable")));
        let (state, _) = webhook(kube, secrets);

        let pod = pod_with(&[("web", "alpine")]);
        let err = admit(&state, &request_for(&pod, APP_NS)).await.unwrap_err();
        assert!(matches!(err, WebhookError::SecretUnavailable { .. }));
    }

    #[tokio::test]
    async fn failed_owner_lookup_marks_workload_unknown() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let mut kube = cluster(Some(dk));
        kube.expect_owner_references()
            .returning(|_, _, _, _| Err(Error::backend("forbidden")));
        let (state, _) = webhook(kube, MockSecrets::new());

        let mut pod = pod_with(&[("web", "alpine")]);
        pod.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "ReplicaSet".to_string(),
                name: "web-7d9f".to_string(),
                uid: "rs-uid".to_string(),
                controller: Some(true),
                ..Default::default()
            },
        ]);

        let patch = admit(&state, &request_for(&pod, APP_NS))
            .await
            .unwrap()
            .unwrap();
        let injected = admitted(&pod, &patch);
        assert_eq!(env_of(install(&injected), env::WORKLOAD_KIND), Some("UNKNOWN"));
        assert_eq!(env_of(install(&injected), env::WORKLOAD_NAME), Some("UNKNOWN"));
    }

    #[tokio::test]
    async fn api_errors_deny_for_retry() {
        let mut kube = MockWebhookKubeClient::new();
        kube.expect_get_namespace()
            .returning(|_| Err(Error::backend("connection refused")));
        let (state, _) = webhook(kube, MockSecrets::new());

        let pod = pod_with(&[("web", "alpine")]);
        let review = review_json(mutate_pod(&state, &request_for(&pod, APP_NS)).await);
        assert_eq!(review["response"]["allowed"], false);
        assert!(review["response"]["status"]["message"]
            .as_str()
            .unwrap()
            .contains("will retry"));
    }
}
