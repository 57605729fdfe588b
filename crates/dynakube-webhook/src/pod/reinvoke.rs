//! Reinvocation of the pod webhook on already injected pods
//!
//! Other mutating webhooks may add containers after the first injection.
//! On reinvocation only those containers are injected; the install container
//! gets one more `CONTAINER_<n>_*` pair appended so existing indices, and the
//! config files named after them, stay valid.

use k8s_openapi::api::core::v1::{Pod, PodSpec};
use tracing::{info, warn};

use dynakube_common::env;

use super::inject::{
    add_container_entry, has_env, has_mount, listed_containers, PodInjector, PodSettings,
    ENDPOINT_VOLUME, INSTALL_CONTAINER_NAME,
};

impl PodInjector<'_> {
    /// Inject containers added since the last admission.
    ///
    /// Returns `false` without touching the pod when every container already
    /// carries the injection.
    pub fn reinvoke(&self, pod: &mut Pod) -> bool {
        let settings = PodSettings::from_pod(pod, self.dynakube, self.config);
        let volumes = self.volumes();
        let Some(PodSpec {
            containers,
            init_containers,
            volumes: pod_volumes,
            ..
        }) = pod.spec.as_mut()
        else {
            return false;
        };

        let mut install = init_containers
            .as_mut()
            .and_then(|ics| ics.iter_mut().find(|c| c.name == INSTALL_CONTAINER_NAME));
        let mut updated = false;

        for container in containers.iter_mut() {
            let oneagent_missing = self.parts.oneagent && !has_env(container, env::LD_PRELOAD);
            let enrichment_missing = self.parts.enrichment && !has_mount(container, ENDPOINT_VOLUME);
            if !oneagent_missing && !enrichment_missing {
                continue;
            }

            info!(
                container = %container.name,
                oneagent = oneagent_missing,
                enrichment = enrichment_missing,
                "instrumenting missing container"
            );
            if oneagent_missing {
                self.inject_oneagent(container, &settings);
            }
            if enrichment_missing {
                self.inject_enrichment(container);
            }

            match install.as_deref_mut() {
                Some(ic) => {
                    let listed = listed_containers(ic);
                    if !listed.contains(&container.name) {
                        add_container_entry(ic, listed.len() + 1, container);
                    }
                }
                None => warn!(container = %container.name, "install container missing on injected pod"),
            }
            updated = true;
        }

        if updated {
            let existing = pod_volumes.get_or_insert_with(Vec::new);
            for volume in volumes {
                if !existing.iter().any(|v| v.name == volume.name) {
                    existing.push(volume);
                }
            }
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dynakube, injector, pod_with};
    use crate::WebhookConfig;
    use k8s_openapi::api::core::v1::Container;

    fn env_of<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    fn install(pod: &Pod) -> &Container {
        &pod.spec.as_ref().unwrap().init_containers.as_ref().unwrap()[0]
    }

    #[test]
    fn injected_pods_are_left_alone() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let config = WebhookConfig::default();
        let injector = injector(&dk, &config);
        let mut pod = pod_with(&[("web", "alpine")]);
        injector.inject(&mut pod);
        let before = pod.clone();

        assert!(!injector.reinvoke(&mut pod));
        assert_eq!(pod, before);
    }

    /// Story: a sidecar added by another webhook is injected on reinvocation
    #[test]
    fn story_reinvocation_adds_sidecar() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let config = WebhookConfig::default();
        let injector = injector(&dk, &config);
        let mut pod = pod_with(&[("web", "alpine")]);
        injector.inject(&mut pod);
        pod.spec.as_mut().unwrap().containers.push(Container {
            name: "sidecar".to_string(),
            image: Some("nginx".to_string()),
            ..Default::default()
        });

        assert!(injector.reinvoke(&mut pod));

        let ic = install(&pod);
        assert_eq!(env_of(ic, "CONTAINER_1_NAME"), Some("web"));
        assert_eq!(env_of(ic, "CONTAINER_2_NAME"), Some("sidecar"));
        assert_eq!(env_of(ic, "CONTAINER_2_IMAGE"), Some("nginx"));
        assert_eq!(env_of(ic, env::CONTAINERS_COUNT), Some("2"));

        let sidecar = &pod.spec.as_ref().unwrap().containers[1];
        assert_eq!(
            env_of(sidecar, env::LD_PRELOAD),
            Some("/opt/dynatrace/oneagent-paas/agent/lib64/liboneagentproc.so")
        );
        assert!(has_mount(sidecar, ENDPOINT_VOLUME));

        assert!(!injector.reinvoke(&mut pod));
    }

    #[test]
    fn containers_inserted_in_front_keep_existing_indices() {
        let dk = dynakube("applicationMonitoring: {}", &[]);
        let config = WebhookConfig::default();
        let injector = injector(&dk, &config);
        let mut pod = pod_with(&[("web", "alpine")]);
        injector.inject(&mut pod);
        pod.spec.as_mut().unwrap().containers.insert(
            0,
            Container {
                name: "proxy".to_string(),
                image: Some("envoy".to_string()),
                ..Default::default()
            },
        );

        assert!(injector.reinvoke(&mut pod));
        assert_eq!(listed_containers(install(&pod)), vec!["web", "proxy"]);
    }
}
