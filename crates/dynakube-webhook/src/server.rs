//! HTTPS server hosting the admission webhooks

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::error::WebhookError;
use crate::namespace::namespace_handler;
use crate::pod::mutate_handler;
use crate::WebhookState;

/// Path of the pod mutation webhook
pub const INJECT_PATH: &str = "/inject";
/// Path of the namespace labelling webhook
pub const LABEL_NAMESPACE_PATH: &str = "/label-ns";

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS certificate PEM
    pub cert_pem: String,
    /// TLS private key PEM
    pub key_pem: String,
}

/// Routes of the webhook server
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(INJECT_PATH, post(mutate_handler))
        .route(LABEL_NAMESPACE_PATH, post(namespace_handler))
        .with_state(state)
}

/// Serve the webhooks until the server fails
pub async fn serve(config: ServerConfig, state: Arc<WebhookState>) -> Result<(), WebhookError> {
    let app = router(state);

    let tls_config =
        RustlsConfig::from_pem(config.cert_pem.into_bytes(), config.key_pem.into_bytes())
            .await
            .map_err(|e| WebhookError::Tls(e.to_string()))?;

    info!(addr = %config.addr, "Starting webhook server");

    axum_server::bind_rustls(config.addr, tls_config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}
