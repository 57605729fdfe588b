//! DynaKube reconciliation controller
//!
//! One pass maps namespaces to the DynaKube, renders the init and endpoint
//! secrets into every owned namespace, removes secrets from namespaces the
//! DynaKube lost, and reports the result in the status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use opentelemetry::KeyValue;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use dynakube_common::crd::{
    Condition, ConditionStatus, DynaKube, DynaKubePhase, DynaKubeStatus,
};
use dynakube_common::events::{actions, dynakube_reference, reasons};
use dynakube_common::metrics::RECONCILE_DURATION;
use dynakube_common::{
    Error, EventPublisher, CLEANUP_FINALIZER, CSI_DAEMONSET_NAME, DEFAULT_OPERATOR_NAMESPACE,
};
use dynakube_dtclient::ConnectionInfo;
use dynakube_injection::{InitGenerator, MappingOutcome, NamespaceMapper};

use crate::kube_client::OperatorKubeClient;

/// Regular requeue interval of a healthy DynaKube
pub const REQUEUE_INTERVAL: Duration = Duration::from_secs(300);
/// Retry interval after a failed reconcile
pub const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Condition reporting the namespace mapping
pub const CONDITION_NAMESPACES_MAPPED: &str = "NamespacesMapped";
/// Condition reporting the tenant connection
pub const CONDITION_TENANT_CONNECTED: &str = "TenantConnected";
/// Condition reporting the overall state
pub const CONDITION_READY: &str = "Ready";

/// Namespace ownership as seen by the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceMapping: Send + Sync {
    /// Label the namespaces `dk` claims and unlabel the ones it lost
    async fn map(&self, dk: &DynaKube) -> Result<MappingOutcome, Error>;

    /// Remove the instance label of `dynakube` from every namespace
    async fn unmap(&self, dynakube: &str) -> Result<Vec<String>, Error>;
}

#[async_trait]
impl NamespaceMapping for NamespaceMapper {
    async fn map(&self, dk: &DynaKube) -> Result<MappingOutcome, Error> {
        self.map_from_dynakube_outcome(dk).await
    }

    async fn unmap(&self, dynakube: &str) -> Result<Vec<String>, Error> {
        self.unmap_from_dynakube(dynakube).await
    }
}

/// Result of rendering the secrets of one DynaKube
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretsOutcome {
    /// Whether any secret was written
    pub updated: bool,
    /// Tenant connection info, when the tenant probe succeeded
    pub connection: Option<ConnectionInfo>,
}

/// Per-namespace secret generation as seen by the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretReconciler: Send + Sync {
    /// Render the secrets of `dk` into `namespaces`
    async fn generate(&self, dk: &DynaKube, namespaces: &[String]) -> Result<SecretsOutcome, Error>;

    /// Delete secrets of `dynakube` outside `keep`
    async fn cleanup(&self, dynakube: &str, keep: &[String]) -> Result<usize, Error>;
}

#[async_trait]
impl SecretReconciler for InitGenerator {
    async fn generate(&self, dk: &DynaKube, namespaces: &[String]) -> Result<SecretsOutcome, Error> {
        let snapshot = self.snapshot(dk).await?;
        let updated = self.apply(&snapshot, namespaces).await?;
        Ok(SecretsOutcome {
            updated,
            connection: snapshot.connection_info().cloned(),
        })
    }

    async fn cleanup(&self, dynakube: &str, keep: &[String]) -> Result<usize, Error> {
        self.cleanup_for_namespaces(dynakube, keep).await
    }
}

/// Controller context
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn OperatorKubeClient>,
    /// Namespace mapper
    pub mapper: Arc<dyn NamespaceMapping>,
    /// Init and endpoint secret generator
    pub secrets: Arc<dyn SecretReconciler>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Namespace of the operator and the DynaKubes
    pub operator_namespace: String,
}

impl Context {
    /// Create a context from its parts
    pub fn new(
        kube: Arc<dyn OperatorKubeClient>,
        mapper: Arc<dyn NamespaceMapping>,
        secrets: Arc<dyn SecretReconciler>,
        events: Arc<dyn EventPublisher>,
        operator_namespace: impl Into<String>,
    ) -> Self {
        Self {
            kube,
            mapper,
            secrets,
            events,
            operator_namespace: operator_namespace.into(),
        }
    }
}

fn has_finalizer(dk: &DynaKube) -> bool {
    dk.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
}

fn namespace_of(dk: &DynaKube, ctx: &Context) -> String {
    dk.namespace().unwrap_or_else(|| {
        if ctx.operator_namespace.is_empty() {
            DEFAULT_OPERATOR_NAMESPACE.to_string()
        } else {
            ctx.operator_namespace.clone()
        }
    })
}

fn condition(type_: &str, ok: bool, reason: &str, message: impl Into<String>) -> Condition {
    let status = if ok {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    Condition::new(type_, status, reason, message)
}

/// Reconcile one DynaKube
#[instrument(skip(dk, ctx), fields(dynakube = %dk.name_any()))]
pub async fn reconcile(dk: Arc<DynaKube>, ctx: Arc<Context>) -> Result<Action, Error> {
    let started = Instant::now();
    debug!("reconciling DynaKube");

    let result = if dk.metadata.deletion_timestamp.is_some() {
        handle_deletion(&dk, &ctx).await
    } else {
        reconcile_active(&dk, &ctx).await
    };

    let outcome = if result.is_ok() { "success" } else { "error" };
    RECONCILE_DURATION.record(
        started.elapsed().as_secs_f64(),
        &[KeyValue::new("result", outcome)],
    );
    result
}

async fn reconcile_active(dk: &DynaKube, ctx: &Context) -> Result<Action, Error> {
    let name = dk.name_any();
    let namespace = namespace_of(dk, ctx);
    let reference = dynakube_reference(&name, &namespace);
    let mut status = dk.status.clone().unwrap_or_default();
    status.observed_generation = dk.metadata.generation;

    if let Err(e) = dk.validate() {
        warn!(dynakube = %name, error = %e, "DynaKube validation failed");
        ctx.events
            .publish(
                &reference,
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        status.phase = DynaKubePhase::Error;
        status.message = Some(e.to_string());
        status.set_condition(condition(CONDITION_READY, false, "ValidationFailed", e.to_string()));
        ctx.kube.patch_status(&name, &namespace, &status).await?;
        // Needs a spec change
        return Ok(Action::await_change());
    }

    if !has_finalizer(dk) {
        debug!(dynakube = %name, "adding cleanup finalizer");
        ctx.kube
            .add_finalizer(&name, &namespace, CLEANUP_FINALIZER)
            .await?;
    }

    if dk.needs_csi() && !ctx.kube.daemonset_exists(CSI_DAEMONSET_NAME, &namespace).await? {
        let message = format!("CSI driver DaemonSet {CSI_DAEMONSET_NAME} not found in {namespace}");
        warn!(dynakube = %name, "{message}");
        status.phase = DynaKubePhase::Error;
        status.message = Some(message.clone());
        status.set_condition(condition(CONDITION_READY, false, "CSIDriverMissing", message));
        ctx.kube.patch_status(&name, &namespace, &status).await?;
        return Ok(Action::requeue(ERROR_REQUEUE_INTERVAL));
    }

    match converge(dk, ctx, &mut status).await {
        Ok(()) => {
            status.phase = DynaKubePhase::Running;
            status.message = None;
            status.last_reconciled = Some(Utc::now());
            status.set_condition(condition(CONDITION_READY, true, "Reconciled", "DynaKube reconciled"));
            ctx.kube.patch_status(&name, &namespace, &status).await?;
            info!(dynakube = %name, namespaces = status.namespaces_claimed.len(), "DynaKube reconciled");
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Err(e) => {
            status.phase = DynaKubePhase::Error;
            status.message = Some(e.to_string());
            status.set_condition(condition(CONDITION_READY, false, "ReconcileFailed", e.to_string()));
            if let Err(patch_err) = ctx.kube.patch_status(&name, &namespace, &status).await {
                warn!(dynakube = %name, error = %patch_err, "failed to record error status");
            }
            Err(e)
        }
    }
}

/// Map namespaces, render secrets and clean up, recording the results in
/// `status`
async fn converge(dk: &DynaKube, ctx: &Context, status: &mut DynaKubeStatus) -> Result<(), Error> {
    let name = dk.name_any();
    let reference = dynakube_reference(&name, &namespace_of(dk, ctx));

    let mapping = ctx.mapper.map(dk).await?;
    if mapping.conflicts.is_empty() {
        status.set_condition(condition(
            CONDITION_NAMESPACES_MAPPED,
            true,
            "Mapped",
            format!("{} namespaces mapped", mapping.owned.len()),
        ));
    } else {
        let listed: Vec<String> = mapping
            .conflicts
            .iter()
            .map(|(ns, owner)| format!("{ns} (owned by {owner})"))
            .collect();
        let message = format!("namespaces claimed by another DynaKube: {}", listed.join(", "));
        ctx.events
            .publish(
                &reference,
                EventType::Warning,
                reasons::NAMESPACE_CONFLICT,
                actions::RECONCILE,
                Some(message.clone()),
            )
            .await;
        status.set_condition(condition(
            CONDITION_NAMESPACES_MAPPED,
            false,
            reasons::NAMESPACE_CONFLICT,
            message,
        ));
    }
    status.namespaces_claimed = mapping.owned.clone();

    let secrets = ctx.secrets.generate(dk, &mapping.owned).await?;
    if secrets.updated {
        ctx.events
            .publish(
                &reference,
                EventType::Normal,
                reasons::SECRETS_GENERATED,
                actions::RECONCILE,
                Some(format!("secrets written for {} namespaces", mapping.owned.len())),
            )
            .await;
    }
    match &secrets.connection {
        Some(info) => {
            status.tenant_uuid = Some(info.tenant_uuid.clone());
            status.communication_endpoints = info.communication_endpoints.clone();
            status.set_condition(condition(CONDITION_TENANT_CONNECTED, true, "Connected", "tenant reachable"));
        }
        None => {
            status.set_condition(condition(
                CONDITION_TENANT_CONNECTED,
                false,
                "ProbeFailed",
                "tenant unreachable, existing secrets kept",
            ));
        }
    }

    ctx.secrets.cleanup(&name, &mapping.owned).await?;

    if status.kube_system_uuid.is_none() {
        status.kube_system_uuid = Some(ctx.kube.kube_system_uid().await?);
    }
    Ok(())
}

async fn handle_deletion(dk: &DynaKube, ctx: &Context) -> Result<Action, Error> {
    let name = dk.name_any();
    if !has_finalizer(dk) {
        return Ok(Action::await_change());
    }

    let unmapped = ctx.mapper.unmap(&name).await?;
    let deleted = ctx.secrets.cleanup(&name, &[]).await?;
    ctx.kube
        .remove_finalizer(&name, &namespace_of(dk, ctx), CLEANUP_FINALIZER)
        .await?;
    info!(
        dynakube = %name,
        namespaces = unmapped.len(),
        secrets = deleted,
        "DynaKube cleaned up"
    );
    Ok(Action::await_change())
}

/// Error policy for the controller
pub fn error_policy(dk: Arc<DynaKube>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        dynakube = %dk.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use crate::kube_client::MockOperatorKubeClient;

    #[derive(Clone, Default)]
    struct RecordedEvents(Arc<Mutex<Vec<(String, String)>>>);

    impl RecordedEvents {
        fn reasons(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordedEvents {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            note: Option<String>,
        ) {
            self.0
                .lock()
                .unwrap()
                .push((reason.to_string(), note.unwrap_or_default()));
        }
    }

    fn dynakube(one_agent: &str) -> DynaKube {
        serde_yaml::from_str(&format!(
            r#"
apiVersion: dynatrace.com/v1beta1
kind: DynaKube
metadata:
  name: dk
  namespace: dynatrace
  generation: 3
  finalizers: ["{CLEANUP_FINALIZER}"]
spec:
  apiUrl: https://t.example/api
  oneAgent:
    {one_agent}
"#
        ))
        .unwrap()
    }

    fn app_monitoring() -> DynaKube {
        dynakube("applicationMonitoring: {}")
    }

    fn connection() -> ConnectionInfo {
        ConnectionInfo {
            tenant_uuid: "abc123".to_string(),
            communication_endpoints: vec!["https://t.example/communication".to_string()],
        }
    }

    fn owned(names: &[&str]) -> MappingOutcome {
        MappingOutcome {
            owned: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    type StatusLog = Arc<Mutex<Vec<DynaKubeStatus>>>;

    fn recording_kube() -> (MockOperatorKubeClient, StatusLog) {
        let statuses: StatusLog = Arc::new(Mutex::new(Vec::new()));
        let log = statuses.clone();
        let mut kube = MockOperatorKubeClient::new();
        kube.expect_patch_status().returning(move |_, _, status| {
            log.lock().unwrap().push(status.clone());
            Ok(())
        });
        kube.expect_kube_system_uid()
            .returning(|| Ok("kube-system-uid".to_string()));
        (kube, statuses)
    }

    fn context(
        kube: MockOperatorKubeClient,
        mapper: MockNamespaceMapping,
        secrets: MockSecretReconciler,
        events: RecordedEvents,
    ) -> Arc<Context> {
        Arc::new(Context::new(
            Arc::new(kube),
            Arc::new(mapper),
            Arc::new(secrets),
            Arc::new(events),
            "dynatrace",
        ))
    }

    fn last(statuses: &StatusLog) -> DynaKubeStatus {
        statuses.lock().unwrap().last().cloned().unwrap()
    }

    /// Story: a valid DynaKube maps its namespaces and fills them with secrets
    #[tokio::test]
    async fn story_reconcile_maps_and_generates() {
        let (kube, statuses) = recording_kube();
        let mut mapper = MockNamespaceMapping::new();
        mapper.expect_map().returning(|_| Ok(owned(&["a", "b"])));
        let mut secrets = MockSecretReconciler::new();
        secrets
            .expect_generate()
            .withf(|_, namespaces| namespaces.to_vec() == vec!["a".to_string(), "b".to_string()])
            .times(1)
            .returning(|_, _| {
                Ok(SecretsOutcome {
                    updated: true,
                    connection: Some(connection()),
                })
            });
        secrets
            .expect_cleanup()
            .withf(|dk, keep| dk == "dk" && keep.len() == 2)
            .times(1)
            .returning(|_, _| Ok(1));
        let events = RecordedEvents::default();

        let action = reconcile(
            Arc::new(app_monitoring()),
            context(kube, mapper, secrets, events.clone()),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));
        let status = last(&statuses);
        assert_eq!(status.phase, DynaKubePhase::Running);
        assert_eq!(status.namespaces_claimed, vec!["a", "b"]);
        assert_eq!(status.tenant_uuid.as_deref(), Some("abc123"));
        assert_eq!(status.kube_system_uuid.as_deref(), Some("kube-system-uid"));
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(
            status.condition(CONDITION_NAMESPACES_MAPPED).unwrap().status,
            ConditionStatus::True
        );
        assert_eq!(events.reasons(), vec![reasons::SECRETS_GENERATED]);
    }

    /// Story: a second DynaKube claiming an owned namespace reports the
    /// conflict without stealing it
    #[tokio::test]
    async fn story_namespace_conflict_is_reported() {
        let (kube, statuses) = recording_kube();
        let mut mapper = MockNamespaceMapping::new();
        mapper.expect_map().returning(|_| {
            Ok(MappingOutcome {
                owned: vec!["mine".to_string()],
                updated: vec![],
                conflicts: vec![("shared".to_string(), "first".to_string())],
            })
        });
        let mut secrets = MockSecretReconciler::new();
        secrets.expect_generate().returning(|_, _| {
            Ok(SecretsOutcome {
                updated: false,
                connection: Some(connection()),
            })
        });
        secrets.expect_cleanup().returning(|_, _| Ok(0));
        let events = RecordedEvents::default();

        let action = reconcile(
            Arc::new(app_monitoring()),
            context(kube, mapper, secrets, events.clone()),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));
        assert_eq!(events.reasons(), vec![reasons::NAMESPACE_CONFLICT]);
        let status = last(&statuses);
        let mapped = status.condition(CONDITION_NAMESPACES_MAPPED).unwrap();
        assert_eq!(mapped.status, ConditionStatus::False);
        assert!(mapped.message.contains("shared (owned by first)"));
        assert_eq!(status.namespaces_claimed, vec!["mine"]);
    }

    /// Story: an invalid DynaKube is reported and waits for a spec change
    #[tokio::test]
    async fn story_invalid_dynakube_awaits_change() {
        let (kube, statuses) = recording_kube();
        let mut mapper = MockNamespaceMapping::new();
        mapper.expect_map().never();
        let events = RecordedEvents::default();
        let mut dk = app_monitoring();
        dk.spec.api_url = "https://t.example/wrong".to_string();

        let action = reconcile(
            Arc::new(dk),
            context(kube, mapper, MockSecretReconciler::new(), events.clone()),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(events.reasons(), vec![reasons::VALIDATION_FAILED]);
        assert_eq!(last(&statuses).phase, DynaKubePhase::Error);
    }

    #[tokio::test]
    async fn finalizer_is_added_once() {
        let (mut kube, _) = recording_kube();
        kube.expect_add_finalizer()
            .withf(|name, ns, finalizer| name == "dk" && ns == "dynatrace" && finalizer == CLEANUP_FINALIZER)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut mapper = MockNamespaceMapping::new();
        mapper.expect_map().returning(|_| Ok(owned(&[])));
        let mut secrets = MockSecretReconciler::new();
        secrets
            .expect_generate()
            .returning(|_, _| Ok(SecretsOutcome::default()));
        secrets.expect_cleanup().returning(|_, _| Ok(0));
        let mut dk = app_monitoring();
        dk.metadata.finalizers = None;

        reconcile(
            Arc::new(dk),
            context(kube, mapper, secrets, RecordedEvents::default()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn missing_csi_driver_blocks_reconcile() {
        let (mut kube, statuses) = recording_kube();
        kube.expect_daemonset_exists()
            .withf(|name, _| name == CSI_DAEMONSET_NAME)
            .returning(|_, _| Ok(false));
        let mut mapper = MockNamespaceMapping::new();
        mapper.expect_map().never();

        let action = reconcile(
            Arc::new(dynakube("cloudNativeFullStack: {}")),
            context(kube, mapper, MockSecretReconciler::new(), RecordedEvents::default()),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::requeue(ERROR_REQUEUE_INTERVAL));
        let status = last(&statuses);
        assert_eq!(status.phase, DynaKubePhase::Error);
        assert!(status.message.unwrap().contains(CSI_DAEMONSET_NAME));
    }

    #[tokio::test]
    async fn unreachable_tenant_keeps_running() {
        let (kube, statuses) = recording_kube();
        let mut mapper = MockNamespaceMapping::new();
        mapper.expect_map().returning(|_| Ok(owned(&["a"])));
        let mut secrets = MockSecretReconciler::new();
        secrets
            .expect_generate()
            .returning(|_, _| Ok(SecretsOutcome::default()));
        secrets.expect_cleanup().returning(|_, _| Ok(0));

        reconcile(
            Arc::new(app_monitoring()),
            context(kube, mapper, secrets, RecordedEvents::default()),
        )
        .await
        .unwrap();

        let status = last(&statuses);
        assert_eq!(status.phase, DynaKubePhase::Running);
        assert_eq!(
            status.condition(CONDITION_TENANT_CONNECTED).unwrap().status,
            ConditionStatus::False
        );
    }

    #[tokio::test]
    async fn secret_failures_surface_in_status() {
        let (kube, statuses) = recording_kube();
        let mut mapper = MockNamespaceMapping::new();
        mapper.expect_map().returning(|_| Ok(owned(&["a"])));
        let mut secrets = MockSecretReconciler::new();
        secrets
            .expect_generate()
            .returning(|_, _| Err(Error::not_found("Secret", "dk")));
        secrets.expect_cleanup().never();

        let result = reconcile(
            Arc::new(app_monitoring()),
            context(kube, mapper, secrets, RecordedEvents::default()),
        )
        .await;

        assert!(result.is_err());
        let status = last(&statuses);
        assert_eq!(status.phase, DynaKubePhase::Error);
        assert!(status.message.is_some());
    }

    /// Story: deleting a DynaKube releases its namespaces and secrets
    #[tokio::test]
    async fn story_deletion_cleans_up() {
        let mut kube = MockOperatorKubeClient::new();
        kube.expect_remove_finalizer()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut mapper = MockNamespaceMapping::new();
        mapper
            .expect_unmap()
            .withf(|name| name == "dk")
            .times(1)
            .returning(|_| Ok(vec!["a".to_string()]));
        let mut secrets = MockSecretReconciler::new();
        secrets
            .expect_cleanup()
            .withf(|_, keep| keep.is_empty())
            .times(1)
            .returning(|_, _| Ok(2));
        let mut dk = app_monitoring();
        dk.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let action = reconcile(
            Arc::new(dk),
            context(kube, mapper, secrets, RecordedEvents::default()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn failed_cleanup_keeps_the_finalizer() {
        let mut kube = MockOperatorKubeClient::new();
        kube.expect_remove_finalizer().never();
        let mut mapper = MockNamespaceMapping::new();
        mapper
            .expect_unmap()
            .returning(|_| Err(Error::backend("connection refused")));
        let mut dk = app_monitoring();
        dk.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let result = reconcile(
            Arc::new(dk),
            context(kube, mapper, MockSecretReconciler::new(), RecordedEvents::default()),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn errors_requeue_after_backoff() {
        let ctx = context(
            MockOperatorKubeClient::new(),
            MockNamespaceMapping::new(),
            MockSecretReconciler::new(),
            RecordedEvents::default(),
        );
        let action = error_policy(
            Arc::new(app_monitoring()),
            &Error::backend("timeout"),
            ctx,
        );
        assert_eq!(action, Action::requeue(ERROR_REQUEUE_INTERVAL));
    }
}
