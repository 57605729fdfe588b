//! Workload resolution for metadata enrichment
//!
//! A pod is attributed to the root of its controller chain, e.g. a pod owned
//! by a ReplicaSet owned by a Deployment belongs to the Deployment. Only
//! well-known workload kinds are followed; anything else stops the walk.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::debug;

use dynakube_common::Error;

use crate::kube_client::WebhookKubeClient;

const POD_KIND: &str = "Pod";

/// Upper bound on owner hops; real chains are at most three deep
const MAX_OWNER_DEPTH: usize = 8;

const WELL_KNOWN_WORKLOADS: [(&str, &str); 8] = [
    ("apps/v1", "ReplicaSet"),
    ("apps/v1", "Deployment"),
    ("v1", "ReplicationController"),
    ("apps/v1", "StatefulSet"),
    ("apps/v1", "DaemonSet"),
    ("batch/v1", "Job"),
    ("batch/v1", "CronJob"),
    ("apps.openshift.io/v1", "DeploymentConfig"),
];

/// Kind and name of the workload a pod belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadInfo {
    /// Workload kind, e.g. `Deployment`
    pub kind: String,
    /// Workload name
    pub name: String,
}

impl WorkloadInfo {
    /// Placeholder used when the owner chain could not be read
    pub fn unknown() -> Self {
        Self {
            kind: dynakube_common::env::UNKNOWN_WORKLOAD.to_string(),
            name: dynakube_common::env::UNKNOWN_WORKLOAD.to_string(),
        }
    }
}

fn is_well_known(owner: &OwnerReference) -> bool {
    WELL_KNOWN_WORKLOADS
        .iter()
        .any(|(api_version, kind)| owner.api_version == *api_version && owner.kind == *kind)
}

fn controller_owner(owners: &[OwnerReference]) -> Option<&OwnerReference> {
    owners
        .iter()
        .find(|o| o.controller == Some(true) && is_well_known(o))
}

/// Pod name, or the base of its generated name while the name is unset
fn pod_identity(pod: &Pod) -> String {
    match pod.metadata.name.as_deref().filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => crate::pod::base_pod_name(pod),
    }
}

/// Walk the controller chain of `pod` in `namespace` up to its root.
///
/// Pods without a well-known controller are their own workload. An owner
/// that no longer exists ends the walk at the last object that was found.
pub async fn resolve_workload(
    kube: &dyn WebhookKubeClient,
    pod: &Pod,
    namespace: &str,
) -> Result<WorkloadInfo, Error> {
    let mut current = WorkloadInfo {
        kind: POD_KIND.to_string(),
        name: pod_identity(pod),
    };
    let mut owners = pod.owner_references().to_vec();

    for _ in 0..MAX_OWNER_DEPTH {
        let Some(owner) = controller_owner(&owners) else {
            break;
        };
        let Some(next) = kube
            .owner_references(&owner.api_version, &owner.kind, &owner.name, namespace)
            .await?
        else {
            debug!(kind = %owner.kind, name = %owner.name, namespace, "owner not found");
            break;
        };
        current = WorkloadInfo {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
        };
        owners = next;
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_client::MockWebhookKubeClient;
    use kube::api::ObjectMeta;
    use mockall::predicate::eq;

    fn owner(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("{name}-uid"),
            controller: Some(true),
            ..Default::default()
        }
    }

    fn pod(name: Option<&str>, generate_name: Option<&str>, owners: Vec<OwnerReference>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.map(str::to_string),
                generate_name: generate_name.map(str::to_string),
                owner_references: Some(owners),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Story: a Deployment pod is attributed to the Deployment
    #[tokio::test]
    async fn story_replicaset_resolves_to_deployment() {
        let mut kube = MockWebhookKubeClient::new();
        kube.expect_owner_references()
            .with(eq("apps/v1"), eq("ReplicaSet"), eq("web-7d9f"), eq("ns-a"))
            .returning(|_, _, _, _| Ok(Some(vec![owner("apps/v1", "Deployment", "web")])));
        kube.expect_owner_references()
            .with(eq("apps/v1"), eq("Deployment"), eq("web"), eq("ns-a"))
            .returning(|_, _, _, _| Ok(Some(vec![])));

        let pod = pod(None, Some("web-7d9f-"), vec![owner("apps/v1", "ReplicaSet", "web-7d9f")]);
        let workload = resolve_workload(&kube, &pod, "ns-a").await.unwrap();
        assert_eq!(
            workload,
            WorkloadInfo {
                kind: "Deployment".to_string(),
                name: "web".to_string()
            }
        );
    }

    /// Story: a CronJob pod walks Job to CronJob
    #[tokio::test]
    async fn story_cronjob_chain() {
        let mut kube = MockWebhookKubeClient::new();
        kube.expect_owner_references()
            .with(eq("batch/v1"), eq("Job"), eq("backup-123"), eq("ns-a"))
            .returning(|_, _, _, _| Ok(Some(vec![owner("batch/v1", "CronJob", "backup")])));
        kube.expect_owner_references()
            .with(eq("batch/v1"), eq("CronJob"), eq("backup"), eq("ns-a"))
            .returning(|_, _, _, _| Ok(Some(vec![])));

        let pod = pod(Some("backup-123-x"), None, vec![owner("batch/v1", "Job", "backup-123")]);
        let workload = resolve_workload(&kube, &pod, "ns-a").await.unwrap();
        assert_eq!(workload.kind, "CronJob");
        assert_eq!(workload.name, "backup");
    }

    #[tokio::test]
    async fn bare_pods_are_their_own_workload() {
        let kube = MockWebhookKubeClient::new();
        let workload = resolve_workload(&kube, &pod(Some("debug"), None, vec![]), "ns-a")
            .await
            .unwrap();
        assert_eq!(workload.kind, "Pod");
        assert_eq!(workload.name, "debug");
    }

    #[tokio::test]
    async fn unknown_and_non_controller_owners_are_not_followed() {
        let kube = MockWebhookKubeClient::new();
        let mut not_controller = owner("apps/v1", "ReplicaSet", "rs");
        not_controller.controller = None;
        let custom = owner("example.com/v1", "Custom", "c");

        let workload = resolve_workload(
            &kube,
            &pod(Some("p-1"), None, vec![not_controller, custom]),
            "ns-a",
        )
        .await
        .unwrap();
        assert_eq!(workload.kind, "Pod");
    }

    #[tokio::test]
    async fn missing_owner_stops_at_last_found_object() {
        let mut kube = MockWebhookKubeClient::new();
        kube.expect_owner_references()
            .returning(|_, _, _, _| Ok(None));

        let workload = resolve_workload(
            &kube,
            &pod(Some("p-1"), None, vec![owner("apps/v1", "StatefulSet", "db")]),
            "ns-a",
        )
        .await
        .unwrap();
        assert_eq!(workload.kind, "Pod");
        assert_eq!(workload.name, "p-1");
    }

    #[tokio::test]
    async fn lookup_errors_propagate() {
        let mut kube = MockWebhookKubeClient::new();
        kube.expect_owner_references()
            .returning(|_, _, _, _| Err(Error::backend("api server unavailable")));

        let result = resolve_workload(
            &kube,
            &pod(Some("p-1"), None, vec![owner("apps/v1", "DaemonSet", "agent")]),
            "ns-a",
        )
        .await;
        assert!(result.is_err());
    }
}
