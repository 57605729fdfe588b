//! CRD installation

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use dynakube_common::crd::DynaKube;
use dynakube_common::FIELD_MANAGER;

/// Name of the DynaKube CRD
pub const DYNAKUBE_CRD_NAME: &str = "dynakubes.dynatrace.com";

/// The DynaKube CRD as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&DynaKube::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))
}

/// Ensure the DynaKube CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the schema always matches the operator version.
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing DynaKube CRD...");
    crds.patch(DYNAKUBE_CRD_NAME, &params, &Patch::Apply(&DynaKube::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install DynaKube CRD: {}", e))?;

    tracing::info!("DynaKube CRD installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_name_matches_the_generated_crd() {
        let crd = DynaKube::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some(DYNAKUBE_CRD_NAME));
    }

    #[test]
    fn crd_yaml_carries_the_status_subresource() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("kind: CustomResourceDefinition"));
        assert!(yaml.contains("status: {}"));
        assert!(yaml.contains("shortNames"));
    }
}
