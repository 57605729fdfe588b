//! HTTP client for the tenant deployment API
//!
//! Provides a trait-based abstraction so the secret generator and the init
//! runner can be tested without a tenant, while production code talks to the
//! API over reqwest with rustls.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Certificate, NoProxy, Proxy, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

#[cfg(test)]
use mockall::automock;

use dynakube_common::retry::{retry_while, RetryConfig};
use dynakube_common::Error;

use crate::processmoduleconfig::ProcessModuleConfig;

const CONNECTION_INFO_PATH: &str = "v1/deployment/installer/agent/connectioninfo";
const PROCESS_MODULE_CONFIG_PATH: &str = "v1/deployment/installer/agent/processmoduleconfig";
const AGENT_PATH: &str = "v1/deployment/installer/agent/unix/paas";

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Agent downloads are large; they get their own timeout
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Tenant identity and endpoints
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Tenant UUID
    #[serde(rename = "tenantUUID")]
    pub tenant_uuid: String,
    /// Communication endpoints of the tenant
    #[serde(default)]
    pub communication_endpoints: Vec<String>,
}

/// Which code-module archive to download
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentRequest {
    /// Installer flavor, e.g. `default` or `musl`
    pub flavor: String,
    /// CPU architecture, e.g. `x86`
    pub arch: String,
    /// Comma-separated technologies, `all` for everything
    pub technologies: String,
    /// Specific version, latest when `None`
    pub version: Option<String>,
}

/// Connection settings for one tenant
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Tenant API URL, ending in `/api`
    pub api_url: String,
    /// Token used for the deployment API (the PaaS token)
    pub token: String,
    /// Proxy URL
    pub proxy: Option<String>,
    /// Comma-separated hosts that bypass the proxy
    pub no_proxy: Option<String>,
    /// Additional trusted CAs, PEM bundle
    pub trusted_certs: Option<Vec<u8>>,
    /// Disable TLS verification
    pub skip_cert_check: bool,
    /// Network zone passed to the connection info and download endpoints
    pub network_zone: Option<String>,
    /// Host group passed to the process-module config endpoint
    pub host_group: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
}

impl ClientOptions {
    /// Options with defaults for everything but URL and token
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: token.into(),
            proxy: None,
            no_proxy: None,
            trusted_certs: None,
            skip_cert_check: false,
            network_zone: None,
            host_group: None,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

/// Tenant API operations used by the injection pipeline
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DynatraceClient: Send + Sync {
    /// Tenant UUID and communication endpoints
    async fn connection_info(&self) -> Result<ConnectionInfo, Error>;

    /// Process-module config newer than `revision`.
    ///
    /// Returns `None` when the tenant has nothing newer (304) or does not
    /// provide the endpoint (404).
    async fn process_module_config(
        &self,
        revision: u64,
    ) -> Result<Option<ProcessModuleConfig>, Error>;

    /// Download the code-module archive to `dest`, returning its size
    async fn download_agent(&self, request: &AgentRequest, dest: &Path) -> Result<u64, Error>;

    /// Download an archive from an explicit installer URL without tenant auth
    async fn download_agent_from_url(&self, url: &str, dest: &Path) -> Result<u64, Error>;
}

/// Creates clients from connection settings
#[cfg_attr(test, automock)]
pub trait DynatraceClientBuilder: Send + Sync {
    /// Build a client for the given settings
    fn build(&self, options: ClientOptions) -> Result<Arc<dyn DynatraceClient>, Error>;
}

/// Builds [`HttpDynatraceClient`]s
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpDynatraceClientBuilder;

impl DynatraceClientBuilder for HttpDynatraceClientBuilder {
    fn build(&self, options: ClientOptions) -> Result<Arc<dyn DynatraceClient>, Error> {
        Ok(Arc::new(HttpDynatraceClient::new(options)?))
    }
}

/// reqwest-backed [`DynatraceClient`]
pub struct HttpDynatraceClient {
    http: reqwest::Client,
    base: Url,
    options: ClientOptions,
}

impl HttpDynatraceClient {
    /// Create a client for the given settings
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        let base = parse_base_url(&options.api_url)?;

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("dynakube-operator/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10));

        if let Some(proxy_url) = options.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = Proxy::all(proxy_url)
                .map_err(|e| Error::validation(format!("invalid proxy URL: {e}")))?
                .no_proxy(options.no_proxy.as_deref().and_then(NoProxy::from_string));
            builder = builder.proxy(proxy);
        }

        if let Some(pem) = options.trusted_certs.as_deref().filter(|p| !p.is_empty()) {
            let certs = Certificate::from_pem_bundle(pem)
                .map_err(|e| Error::validation(format!("invalid trusted CA bundle: {e}")))?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        if options.skip_cert_check {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| Error::internal_with_context("dtclient", e.to_string()))?;

        Ok(Self {
            http,
            base,
            options,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base
            .join(path)
            .map_err(|e| Error::internal_with_context("dtclient", format!("bad URL {path}: {e}")))
    }

    fn auth_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Api-Token {}", self.options.token))
            .map_err(|_| Error::validation("token contains characters not allowed in a header"))?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    fn agent_url(&self, request: &AgentRequest) -> Result<Url, Error> {
        let path = match &request.version {
            Some(version) => format!("{AGENT_PATH}/version/{version}"),
            None => format!("{AGENT_PATH}/latest"),
        };
        let mut url = self.endpoint(&path)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("bitness", "64")
                .append_pair("skipMetadata", "true");
            if !request.flavor.is_empty() {
                query.append_pair("flavor", &request.flavor);
            }
            if !request.arch.is_empty() {
                query.append_pair("arch", &request.arch);
            }
            for tech in request
                .technologies
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
            {
                query.append_pair("include", tech);
            }
            if let Some(zone) = self.network_zone() {
                query.append_pair("networkZone", zone);
            }
        }
        Ok(url)
    }

    fn network_zone(&self) -> Option<&str> {
        self.options.network_zone.as_deref().filter(|z| !z.is_empty())
    }

    async fn get(&self, url: Url, authorized: bool) -> Result<reqwest::Response, Error> {
        let mut request = self.http.get(url.clone()).timeout(self.options.timeout);
        if authorized {
            request = request.headers(self.auth_headers()?);
        }
        debug!(url = %redact(&url), "tenant API request");
        request
            .send()
            .await
            .map_err(|e| Error::backend(format!("request to {} failed: {e}", redact(&url))))
    }

    async fn download(&self, url: Url, authorized: bool, dest: &Path) -> Result<u64, Error> {
        retry_while(
            &self.options.retry,
            "download_agent",
            || {
                let url = url.clone();
                async move {
                    let mut request = self.http.get(url.clone()).timeout(DOWNLOAD_TIMEOUT);
                    if authorized {
                        request = request.headers(self.auth_headers()?);
                    }
                    let response = request.send().await.map_err(|e| {
                        Error::backend(format!("download from {} failed: {e}", redact(&url)))
                    })?;
                    let response = ensure_success(response).await?;
                    write_body(response, dest).await
                }
            },
            Error::is_retryable,
        )
        .await
    }
}

#[async_trait]
impl DynatraceClient for HttpDynatraceClient {
    async fn connection_info(&self) -> Result<ConnectionInfo, Error> {
        let mut url = self.endpoint(CONNECTION_INFO_PATH)?;
        if let Some(zone) = self.network_zone() {
            url.query_pairs_mut().append_pair("networkZone", zone);
        }

        let info: ConnectionInfo = retry_while(
            &self.options.retry,
            "connection_info",
            || {
                let url = url.clone();
                async move {
                    let response = ensure_success(self.get(url, true).await?).await?;
                    response.json::<ConnectionInfo>().await.map_err(|e| {
                        Error::serialization_for_kind("ConnectionInfo", e.to_string())
                    })
                }
            },
            Error::is_retryable,
        )
        .await?;

        if info.tenant_uuid.is_empty() {
            return Err(Error::backend_status(
                200,
                "connection info response has no tenantUUID",
            ));
        }
        Ok(info)
    }

    async fn process_module_config(
        &self,
        revision: u64,
    ) -> Result<Option<ProcessModuleConfig>, Error> {
        let mut url = self.endpoint(PROCESS_MODULE_CONFIG_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("revision", &revision.to_string());
            if let Some(group) = self.options.host_group.as_deref().filter(|g| !g.is_empty()) {
                query.append_pair("hostGroup", group);
            }
        }

        retry_while(
            &self.options.retry,
            "process_module_config",
            || {
                let url = url.clone();
                async move {
                    let response = self.get(url, true).await?;
                    if matches!(
                        response.status(),
                        StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND
                    ) {
                        return Ok(None);
                    }
                    let response = ensure_success(response).await?;
                    let config = response.json::<ProcessModuleConfig>().await.map_err(|e| {
                        Error::serialization_for_kind("ProcessModuleConfig", e.to_string())
                    })?;
                    Ok::<_, Error>(Some(config))
                }
            },
            Error::is_retryable,
        )
        .await
    }

    async fn download_agent(&self, request: &AgentRequest, dest: &Path) -> Result<u64, Error> {
        let url = self.agent_url(request)?;
        info!(
            flavor = %request.flavor,
            arch = %request.arch,
            technologies = %request.technologies,
            version = request.version.as_deref().unwrap_or("latest"),
            "downloading code modules"
        );
        self.download(url, true, dest).await
    }

    async fn download_agent_from_url(&self, url: &str, dest: &Path) -> Result<u64, Error> {
        let url = Url::parse(url)
            .map_err(|e| Error::validation(format!("invalid installer URL: {e}")))?;
        info!(url = %redact(&url), "downloading code modules from installer URL");
        self.download(url, false, dest).await
    }
}

/// Base URL with a trailing slash so relative joins stay below `/api`
fn parse_base_url(api_url: &str) -> Result<Url, Error> {
    let trimmed = api_url.trim().trim_end_matches('/');
    Url::parse(&format!("{trimmed}/"))
        .map_err(|e| Error::validation(format!("invalid apiUrl '{api_url}': {e}")))
}

/// URL without query string, for logs
fn redact(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body = body.chars().take(256).collect::<String>();
    Err(Error::backend_status(
        status.as_u16(),
        format!("tenant API answered {status}: {body}"),
    ))
}

async fn write_body(response: reqwest::Response, dest: &Path) -> Result<u64, Error> {
    let path = dest.display().to_string();
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| Error::io(&path, e.to_string()))?;

    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::backend(format!("download interrupted: {e}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| Error::io(&path, e.to_string()))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|e| Error::io(&path, e.to_string()))?;
    Ok(written)
}
