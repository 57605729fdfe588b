//! Namespace mapping and per-namespace secret generation
//!
//! The [`mapper`] decides which DynaKube owns a namespace and records it in
//! the namespace's instance label. The [`initgen`] renders the init and
//! endpoint secrets into every owned namespace. Both run during DynaKube
//! reconciliation, mapping first; the pod webhook calls the generator on
//! demand when a pod races ahead of the reconcile.

#![deny(missing_docs)]

pub mod initgen;
pub mod kube_client;
pub mod mapper;

pub use initgen::{InitGenerator, SecretGenerator, SecretSnapshot};
pub use kube_client::{InjectionKubeClient, InjectionKubeClientImpl};
pub use mapper::{dynakube_claims, instance_of, IgnoredNamespaces, MappingOutcome, NamespaceMapper};
