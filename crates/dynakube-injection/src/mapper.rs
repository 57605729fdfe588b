//! Namespace mapping
//!
//! Decides which DynaKube owns a namespace and records the decision in the
//! namespace's instance label. The label is the only link the pod webhook
//! follows from a pod to its DynaKube.
//!
//! A namespace belongs to a DynaKube when the DynaKube injects applications,
//! its namespace selector matches the namespace labels, and the namespace is
//! not ignored. Ownership is first-come-first-served: a namespace already
//! labelled for another DynaKube that still claims it is a conflict for the
//! newcomer, and its label is left alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use opentelemetry::KeyValue;
use regex::Regex;
use tracing::{debug, info, warn};

use dynakube_common::crd::DynaKube;
use dynakube_common::kube_utils::retry_on_conflict_once;
use dynakube_common::metrics::NAMESPACE_CONFLICTS;
use dynakube_common::{Error, INSTANCE_LABEL};

use crate::kube_client::InjectionKubeClient;

/// Namespaces a DynaKube never claims
#[derive(Debug)]
pub struct IgnoredNamespaces {
    operator_namespace: String,
    patterns: Vec<Regex>,
}

impl IgnoredNamespaces {
    /// Compile the ignore list of a DynaKube; invalid expressions are skipped
    pub fn for_dynakube(dk: &DynaKube, operator_namespace: &str) -> Self {
        let patterns = dk
            .feature_flags()
            .ignored_namespaces(operator_namespace)
            .into_iter()
            .filter_map(|p| match Regex::new(&p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(dynakube = %dk.name_any(), pattern = %p, error = %e, "invalid ignored-namespace pattern");
                    None
                }
            })
            .collect();
        Self {
            operator_namespace: operator_namespace.to_string(),
            patterns,
        }
    }

    /// True for the operator namespace and namespaces matching a pattern
    pub fn is_ignored(&self, namespace: &str) -> bool {
        namespace == self.operator_namespace || self.patterns.iter().any(|re| re.is_match(namespace))
    }
}

fn namespace_labels(ns: &Namespace) -> BTreeMap<String, String> {
    ns.metadata.labels.clone().unwrap_or_default()
}

/// Current instance label of a namespace
pub fn instance_of(ns: &Namespace) -> Option<&str> {
    ns.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(INSTANCE_LABEL))
        .map(String::as_str)
}

/// Whether `dk` claims `ns`
pub fn dynakube_claims(dk: &DynaKube, ns: &Namespace, operator_namespace: &str) -> bool {
    if !dk.needs_app_injection() {
        return false;
    }
    if IgnoredNamespaces::for_dynakube(dk, operator_namespace).is_ignored(&ns.name_any()) {
        return false;
    }
    dk.spec.namespace_selector.matches(&namespace_labels(ns))
}

fn is_terminating(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
}

/// Outcome of mapping one DynaKube onto the cluster's namespaces
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MappingOutcome {
    /// Namespaces the DynaKube owns after the pass, sorted
    pub owned: Vec<String>,
    /// Namespaces whose label was written during the pass
    pub updated: Vec<String>,
    /// Namespaces the DynaKube claims but another DynaKube already owns,
    /// with that owner
    pub conflicts: Vec<(String, String)>,
}

impl MappingOutcome {
    /// The first conflict as an error, if any
    pub fn conflict_error(&self, dynakube: &str) -> Option<Error> {
        self.conflicts
            .first()
            .map(|(ns, owner)| Error::conflict(ns, vec![owner.clone(), dynakube.to_string()]))
    }
}

/// Maps namespaces to DynaKubes via the instance label
pub struct NamespaceMapper {
    kube: Arc<dyn InjectionKubeClient>,
    operator_namespace: String,
}

impl NamespaceMapper {
    /// Create a mapper for DynaKubes living in `operator_namespace`
    pub fn new(kube: Arc<dyn InjectionKubeClient>, operator_namespace: impl Into<String>) -> Self {
        Self {
            kube,
            operator_namespace: operator_namespace.into(),
        }
    }

    /// Label every namespace `dk` claims and unlabel the ones it lost.
    ///
    /// Non-conflicting namespaces are always converged. If any namespace is
    /// owned by another DynaKube that still claims it, a conflict error is
    /// returned after the pass; use [`Self::map_from_dynakube_outcome`] to
    /// get the full outcome instead.
    pub async fn map_from_dynakube(&self, dk: &DynaKube) -> Result<Vec<String>, Error> {
        let outcome = self.map_from_dynakube_outcome(dk).await?;
        match outcome.conflict_error(&dk.name_any()) {
            Some(err) => Err(err),
            None => Ok(outcome.owned),
        }
    }

    /// Like [`Self::map_from_dynakube`] but reports conflicts in the outcome
    pub async fn map_from_dynakube_outcome(&self, dk: &DynaKube) -> Result<MappingOutcome, Error> {
        let name = dk.name_any();
        let namespaces = self.kube.list_namespaces().await?;
        let dynakubes = self.kube.list_dynakubes(&self.operator_namespace).await?;

        let mut outcome = MappingOutcome::default();
        for ns in namespaces.iter().filter(|ns| !is_terminating(ns)) {
            let ns_name = ns.name_any();
            let current = instance_of(ns);

            if !dynakube_claims(dk, ns, &self.operator_namespace) {
                if current == Some(name.as_str()) {
                    self.set_instance(&ns_name, None).await?;
                    outcome.updated.push(ns_name);
                }
                continue;
            }

            match current {
                Some(owner) if owner == name => outcome.owned.push(ns_name),
                Some(owner) if self.owner_still_claims(owner, ns, &dynakubes) => {
                    warn!(
                        dynakube = %name,
                        namespace = %ns_name,
                        owner = %owner,
                        "namespace already claimed by another DynaKube"
                    );
                    NAMESPACE_CONFLICTS.add(1, &[KeyValue::new("dynakube", name.clone())]);
                    outcome.conflicts.push((ns_name, owner.to_string()));
                }
                _ => {
                    self.set_instance(&ns_name, Some(&name)).await?;
                    outcome.updated.push(ns_name.clone());
                    outcome.owned.push(ns_name);
                }
            }
        }

        outcome.owned.sort();
        info!(
            dynakube = %name,
            owned = outcome.owned.len(),
            updated = outcome.updated.len(),
            conflicts = outcome.conflicts.len(),
            "mapped namespaces"
        );
        Ok(outcome)
    }

    /// Remove the instance label from every namespace labelled for `dynakube`
    pub async fn unmap_from_dynakube(&self, dynakube: &str) -> Result<Vec<String>, Error> {
        let mut unmapped = Vec::new();
        for ns in self.kube.list_namespaces().await? {
            if instance_of(&ns) == Some(dynakube) {
                let ns_name = ns.name_any();
                self.set_instance(&ns_name, None).await?;
                unmapped.push(ns_name);
            }
        }
        debug!(dynakube, count = unmapped.len(), "unmapped namespaces");
        Ok(unmapped)
    }

    /// Names of namespaces currently labelled for `dynakube`, sorted
    pub async fn owned_namespaces(&self, dynakube: &str) -> Result<Vec<String>, Error> {
        let mut owned: Vec<String> = self
            .kube
            .list_namespaces()
            .await?
            .iter()
            .filter(|ns| instance_of(ns) == Some(dynakube))
            .map(|ns| ns.name_any())
            .collect();
        owned.sort();
        Ok(owned)
    }

    /// Target instance label for a namespace being admitted.
    ///
    /// Returns the DynaKube that should own the namespace, or `None` when
    /// no DynaKube claims it. Several claimants keep the current owner if
    /// it is one of them; otherwise they are a conflict.
    pub async fn map_from_namespace(&self, ns: &Namespace) -> Result<Option<String>, Error> {
        let dynakubes = self.kube.list_dynakubes(&self.operator_namespace).await?;
        let mut claimants: Vec<String> = dynakubes
            .iter()
            .filter(|dk| dk.metadata.deletion_timestamp.is_none())
            .filter(|dk| dynakube_claims(dk, ns, &self.operator_namespace))
            .map(|dk| dk.name_any())
            .collect();
        claimants.sort();

        match claimants.len() {
            0 => Ok(None),
            1 => Ok(claimants.pop()),
            _ => match instance_of(ns) {
                Some(current) if claimants.iter().any(|c| c == current) => {
                    Ok(Some(current.to_string()))
                }
                _ => Err(Error::conflict(ns.name_any(), claimants)),
            },
        }
    }

    fn owner_still_claims(&self, owner: &str, ns: &Namespace, dynakubes: &[DynaKube]) -> bool {
        dynakubes
            .iter()
            .filter(|dk| dk.metadata.deletion_timestamp.is_none())
            .any(|dk| dk.name_any() == owner && dynakube_claims(dk, ns, &self.operator_namespace))
    }

    /// Converge the instance label of one namespace, re-reading it on a
    /// resourceVersion conflict
    async fn set_instance(&self, namespace: &str, instance: Option<&str>) -> Result<(), Error> {
        retry_on_conflict_once("set namespace instance", || async move {
            let Some(ns) = self.kube.get_namespace(namespace).await? else {
                return Ok(());
            };
            if instance_of(&ns) == instance {
                return Ok(());
            }
            self.kube
                .patch_namespace_instance(
                    namespace,
                    instance.map(str::to_string),
                    ns.metadata.resource_version.clone(),
                )
                .await
        })
        .await?;
        info!(namespace, instance = ?instance, "updated namespace instance label");
        Ok(())
    }
}
