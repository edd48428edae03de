//! Client side of the remote execution server running inside an instance.
//!
//! Requests go through the sandbox gateway, which authenticates with
//! `X-Access-Token`. The server behind it authenticates with `X-API-Key`.
//! Gateway tokens are short-lived, so the client asks its
//! [`TokenRefresher`] for a non-stale token before every request.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::DeploymentError;

/// `X-Access-Token`, in the lowercase form `HeaderMap` requires for static names.
pub const GATEWAY_TOKEN_HEADER: &str = "x-access-token";
/// `X-API-Key`.
pub const SERVER_TOKEN_HEADER: &str = "x-api-key";

/// Capability to obtain a non-stale gateway token.
///
/// Injected into the runtime client at construction. The implementor is
/// the deployment's token store, never the deployment itself, so the
/// runtime holds no ownership over the lifecycle object.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn ensure_valid_token(&self) -> Result<String, DeploymentError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsAliveResponse {
    pub is_alive: bool,
    #[serde(default)]
    pub message: String,
}

impl IsAliveResponse {
    pub fn alive() -> Self {
        Self {
            is_alive: true,
            message: String::new(),
        }
    }

    pub fn not_alive(message: impl Into<String>) -> Self {
        Self {
            is_alive: false,
            message: message.into(),
        }
    }
}

/// A bound runtime as seen by the deployment.
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    /// Health probe. Transport failures are reported as `is_alive = false`
    /// rather than errors so the liveness waiter simply retries.
    async fn is_alive(&self, timeout: Option<Duration>) -> Result<IsAliveResponse, DeploymentError>;

    /// Run a command to completion on the remote server.
    async fn execute(&self, command: &Command) -> Result<CommandResponse, DeploymentError>;

    /// Replace the gateway token used for subsequent requests.
    fn set_gateway_token(&self, token: &str);

    async fn close(&self) -> Result<(), DeploymentError>;
}

/// Connection parameters handed to a [`RuntimeConnector`].
#[derive(Clone)]
pub struct RuntimeParams {
    pub host: String,
    pub gateway_token: String,
    pub auth_token: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for RuntimeParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeParams")
            .field("host", &self.host)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builds runtime handles for freshly started instances.
pub trait RuntimeConnector: Send + Sync {
    fn connect(
        &self,
        params: RuntimeParams,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Arc<dyn RuntimeHandle>, DeploymentError>;
}

// ── Wire types ──────────────────────────────────────────────────────

/// One-shot command executed by the remote server.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub command: CommandLine,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    pub shell: bool,
    pub check: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub env: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl Command {
    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            command: CommandLine::Shell(line.into()),
            timeout: None,
            shell: true,
            check: false,
            cwd: None,
            env: Default::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

// ── Client ──────────────────────────────────────────────────────────

/// HTTP client for the execution server behind the sandbox gateway.
pub struct AgsRuntime {
    base_url: String,
    auth_token: String,
    gateway_token: RwLock<String>,
    timeout: Duration,
    client: reqwest::Client,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl AgsRuntime {
    pub fn new(
        params: RuntimeParams,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Result<Self, DeploymentError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| DeploymentError::Runtime(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_host(&params.host),
            auth_token: params.auth_token,
            gateway_token: RwLock::new(params.gateway_token),
            timeout: params.timeout,
            client,
            refresher,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let gateway = self
            .gateway_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !gateway.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&gateway) {
                headers.insert(GATEWAY_TOKEN_HEADER, value);
            }
        }
        if !self.auth_token.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.auth_token) {
                headers.insert(SERVER_TOKEN_HEADER, value);
            }
        }
        headers
    }

    async fn refresh_token(&self) -> Result<(), DeploymentError> {
        if let Some(refresher) = &self.refresher {
            let token = refresher.ensure_valid_token().await?;
            self.set_gateway_token(&token);
        }
        Ok(())
    }

    async fn post<P, T>(&self, endpoint: &str, payload: &P) -> Result<T, DeploymentError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.refresh_token().await?;
        let url = format!("{}/{}", self.base_url, endpoint);
        let resp = self
            .client
            .post(&url)
            .headers(self.headers())
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| DeploymentError::Runtime(format!("{endpoint} request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DeploymentError::Runtime(format!(
                "{endpoint} returned {status}: {body}"
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| DeploymentError::Runtime(format!("failed to parse {endpoint} response: {e}")))
    }
}

/// Add `https://` to hosts given without a scheme and drop trailing slashes.
fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        tracing::warn!(host = %host, "host does not start with http, adding https://");
        format!("https://{host}")
    }
}

#[async_trait]
impl RuntimeHandle for AgsRuntime {
    async fn is_alive(&self, timeout: Option<Duration>) -> Result<IsAliveResponse, DeploymentError> {
        self.refresh_token().await?;
        let url = format!("{}/is_alive", self.base_url);
        let resp = match self
            .client
            .get(&url)
            .headers(self.headers())
            .timeout(timeout.unwrap_or(self.timeout))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return Ok(IsAliveResponse::not_alive(format!(
                    "failed to connect to {url}: {e}"
                )));
            }
        };

        match resp.status().as_u16() {
            200 => Ok(resp
                .json::<IsAliveResponse>()
                .await
                .unwrap_or_else(|e| IsAliveResponse::not_alive(format!("invalid is_alive body: {e}")))),
            404 => Ok(IsAliveResponse::not_alive(format!(
                "route not found at {url}, the server may still be starting"
            ))),
            code => Ok(IsAliveResponse::not_alive(format!(
                "status code {code} from {url}"
            ))),
        }
    }

    async fn execute(&self, command: &Command) -> Result<CommandResponse, DeploymentError> {
        self.post("execute", command).await
    }

    fn set_gateway_token(&self, token: &str) {
        *self.gateway_token.write().unwrap_or_else(PoisonError::into_inner) = token.to_string();
    }

    async fn close(&self) -> Result<(), DeploymentError> {
        let _: serde_json::Value = self.post("close", &serde_json::json!({})).await?;
        tracing::debug!(host = %self.base_url, "runtime closed");
        Ok(())
    }
}

/// Connects [`AgsRuntime`] clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgsRuntimeConnector;

impl RuntimeConnector for AgsRuntimeConnector {
    fn connect(
        &self,
        params: RuntimeParams,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Arc<dyn RuntimeHandle>, DeploymentError> {
        Ok(Arc::new(AgsRuntime::new(params, Some(refresher))?))
    }
}
