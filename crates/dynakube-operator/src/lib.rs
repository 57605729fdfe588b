//! DynaKube operator: reconciles DynaKubes into namespace ownership and
//! injection secrets

#![deny(missing_docs)]

/// DynaKube reconciliation
pub mod controller;
/// Controller wiring
pub mod controller_runner;
/// CRD installation
pub mod crds;
/// Kubernetes operations of the controller
pub mod kube_client;

pub use controller::{error_policy, reconcile, Context};
pub use controller_runner::run_dynakube_controller;
pub use crds::ensure_crds_installed;
