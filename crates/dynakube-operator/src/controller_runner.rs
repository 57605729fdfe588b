//! Controller runner - wires the DynaKube controller to the API server

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use dynakube_common::crd::DynaKube;
use dynakube_common::{KubeEventPublisher, FIELD_MANAGER, INSTANCE_LABEL};
use dynakube_dtclient::HttpDynatraceClientBuilder;
use dynakube_injection::{InitGenerator, InjectionKubeClientImpl, NamespaceMapper};

use crate::controller::{error_policy, reconcile, Context};
use crate::kube_client::OperatorKubeClientImpl;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the controller context from a client
pub fn build_context(client: Client, operator_namespace: &str) -> Context {
    let injection = Arc::new(InjectionKubeClientImpl::new(client.clone()));
    Context::new(
        Arc::new(OperatorKubeClientImpl::new(client.clone())),
        Arc::new(NamespaceMapper::new(injection.clone(), operator_namespace)),
        Arc::new(InitGenerator::new(
            injection,
            Arc::new(HttpDynatraceClientBuilder),
            operator_namespace,
        )),
        Arc::new(KubeEventPublisher::new(client, FIELD_MANAGER)),
        operator_namespace,
    )
}

/// DynaKube owning a namespace, from its instance label
fn owner_of(ns: &Namespace, operator_namespace: &str) -> Option<ObjectRef<DynaKube>> {
    ns.metadata
        .labels
        .as_ref()?
        .get(INSTANCE_LABEL)
        .map(|dk| ObjectRef::new(dk).within(operator_namespace))
}

/// Run the DynaKube controller until a shutdown signal arrives.
///
/// Namespace changes retrigger the DynaKube named by their instance label so
/// that new namespaces get their secrets without waiting for the requeue.
pub async fn run_dynakube_controller(client: Client, operator_namespace: String) {
    let ctx = Arc::new(build_context(client.clone(), &operator_namespace));
    let dynakubes: Api<DynaKube> = Api::namespaced(client.clone(), &operator_namespace);
    let namespaces: Api<Namespace> = Api::all(client);

    tracing::info!(namespace = %operator_namespace, "- DynaKube controller");

    let op_ns = operator_namespace.clone();
    Controller::new(
        dynakubes,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .watches(
        namespaces,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        move |ns| owner_of(&ns, &op_ns),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("DynaKube"))
    .await;
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
