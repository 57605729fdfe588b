//! Metrics registry for the DynaKube operator
//!
//! Instruments are created lazily on first use from the global meter, so
//! they are no-ops until a meter provider is installed by
//! [`crate::telemetry::init_telemetry`].

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("dynakube"));

// ============================================================================
// Admission
// ============================================================================

/// Counter of pods injected on first admission
///
/// Labels:
/// - `dynakube`: owning DynaKube
/// - `namespace`: pod namespace
pub static POD_INJECTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("dynakube_pod_injections_total")
        .with_description("Total number of pods injected at admission")
        .with_unit("{pods}")
        .build()
});

/// Counter of reinvocations that added containers to an injected pod
pub static POD_REINVOCATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("dynakube_pod_reinvocations_total")
        .with_description("Total number of reinvocations that updated a pod")
        .with_unit("{pods}")
        .build()
});

/// Counter of denied admission requests
///
/// Labels:
/// - `reason`: missing_dynakube, secret_unavailable, internal
pub static ADMISSION_DENIALS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("dynakube_admission_denials_total")
        .with_description("Total number of denied admission requests")
        .with_unit("{requests}")
        .build()
});

// ============================================================================
// Reconciliation
// ============================================================================

/// Counter of init/endpoint secret writes
///
/// Labels:
/// - `secret`: init, endpoint
pub static SECRET_WRITES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("dynakube_secret_writes_total")
        .with_description("Total number of per-namespace secret writes")
        .with_unit("{writes}")
        .build()
});

/// Counter of namespaces claimed by more than one DynaKube
pub static NAMESPACE_CONFLICTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("dynakube_namespace_conflicts_total")
        .with_description("Total number of namespace ownership conflicts")
        .with_unit("{conflicts}")
        .build()
});

/// Histogram of DynaKube reconciliation duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("dynakube_reconcile_duration_seconds")
        .with_description("Duration of DynaKube reconciliation in seconds")
        .with_unit("s")
        .build()
});
