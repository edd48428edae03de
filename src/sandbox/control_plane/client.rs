//! HTTP client for the Agent Sandbox control plane (cloud API 3.0).
//!
//! Every action is a signed `POST /` with a JSON body. Responses are
//! wrapped in a `Response` envelope that either carries the result fields
//! or an `Error { Code, Message }` plus the `RequestId`.
//!
//! The client is blocking on purpose. It must only be driven from worker
//! threads (see `sandbox::worker`), which is also where the underlying
//! `reqwest::blocking::Client` gets built.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::models::*;
use super::signing::{self, SigningInput};
use super::{ControlPlane, ControlPlaneError};
use crate::config::DeploymentConfig;

const SERVICE: &str = "ags";
const API_VERSION: &str = "2025-09-20";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking control-plane client with TC3 request signing.
pub struct HttpControlPlane {
    secret_id: String,
    secret_key: String,
    region: String,
    host: String,
    skip_ssl_verify: bool,
    request_timeout: Duration,
    http: OnceLock<reqwest::blocking::Client>,
}

impl std::fmt::Debug for HttpControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpControlPlane")
            .field("secret_id", &self.secret_id)
            .field("region", &self.region)
            .field("host", &self.host)
            .field("skip_ssl_verify", &self.skip_ssl_verify)
            .finish_non_exhaustive()
    }
}

impl HttpControlPlane {
    pub fn new(
        secret_id: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
        endpoint: &str,
    ) -> Self {
        Self {
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
            region: region.into(),
            host: endpoint_host(endpoint),
            skip_ssl_verify: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            http: OnceLock::new(),
        }
    }

    pub fn from_config(config: &DeploymentConfig) -> Self {
        let mut client = Self::new(
            config.secret_id.clone(),
            config.secret_key.clone(),
            config.region.clone(),
            &config.http_endpoint,
        );
        client.skip_ssl_verify = config.skip_ssl_verify;
        client
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn http(&self) -> Result<reqwest::blocking::Client, ControlPlaneError> {
        if let Some(client) = self.http.get() {
            return Ok(client.clone());
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(self.skip_ssl_verify)
            .build()
            .map_err(|e| ControlPlaneError::Transport(format!("failed to build HTTP client: {e}")))?;
        let _ = self.http.set(client.clone());
        Ok(client)
    }

    /// Sign and send one action, returning the unwrapped `Response` body.
    fn call<B, T>(&self, action: &str, body: &B) -> Result<T, ControlPlaneError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let payload = serde_json::to_string(body)
            .map_err(|e| ControlPlaneError::Malformed(format!("failed to encode {action}: {e}")))?;
        let timestamp = Utc::now();
        let authorization = signing::authorization(&SigningInput {
            secret_id: &self.secret_id,
            secret_key: &self.secret_key,
            service: SERVICE,
            host: &self.host,
            action,
            payload: &payload,
            timestamp,
        })?;

        tracing::debug!(action, host = %self.host, "calling control plane");

        let resp = self
            .http()?
            .post(format!("https://{}/", self.host))
            .header("Authorization", authorization)
            .header("Content-Type", signing::CONTENT_TYPE)
            .header("Host", &self.host)
            .header("X-TC-Action", action)
            .header("X-TC-Version", API_VERSION)
            .header("X-TC-Region", &self.region)
            .header("X-TC-Timestamp", timestamp.timestamp().to_string())
            .body(payload)
            .send()
            .map_err(|e| ControlPlaneError::Transport(format!("{action} failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .map_err(|e| ControlPlaneError::Transport(format!("{action} body read failed: {e}")))?;
        if !status.is_success() {
            return Err(ControlPlaneError::Transport(format!(
                "{action} returned {status}: {text}"
            )));
        }

        let result = decode_envelope(action, &text)?;
        tracing::debug!(action, "control plane call succeeded");
        Ok(result)
    }
}

/// Strip scheme and trailing slashes so the value can be used as `Host`.
fn endpoint_host(endpoint: &str) -> String {
    endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

fn decode_envelope<T: DeserializeOwned>(action: &str, text: &str) -> Result<T, ControlPlaneError> {
    let envelope: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ControlPlaneError::Malformed(format!("{action}: invalid JSON: {e}")))?;
    let response = envelope
        .get("Response")
        .ok_or_else(|| ControlPlaneError::Malformed(format!("{action}: missing Response")))?;

    if let Some(error) = response.get("Error") {
        let field = |name: &str| {
            error
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        return Err(ControlPlaneError::Api {
            code: field("Code"),
            message: field("Message"),
            request_id: response
                .get("RequestId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        });
    }

    serde_json::from_value(response.clone())
        .map_err(|e| ControlPlaneError::Malformed(format!("{action}: {e}")))
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ToolIdsBody<'a> {
    tool_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceIdsBody<'a> {
    instance_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceIdBody<'a> {
    instance_id: &'a str,
}

impl ControlPlane for HttpControlPlane {
    fn create_tool(&self, req: &CreateToolRequest) -> Result<String, ControlPlaneError> {
        let resp: CreateToolResponse = self.call("CreateSandboxTool", req)?;
        Ok(resp.tool_id)
    }

    fn describe_tools(&self, tool_ids: &[String]) -> Result<Vec<ToolInfo>, ControlPlaneError> {
        let resp: DescribeToolsResponse =
            self.call("DescribeSandboxToolList", &ToolIdsBody { tool_ids })?;
        Ok(resp.sandbox_tool_set)
    }

    fn start_instance(&self, req: &StartInstanceRequest) -> Result<InstanceInfo, ControlPlaneError> {
        let resp: StartInstanceResponse = self.call("StartSandboxInstance", req)?;
        Ok(resp.instance)
    }

    fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceInfo>, ControlPlaneError> {
        let resp: DescribeInstancesResponse =
            self.call("DescribeSandboxInstanceList", &InstanceIdsBody { instance_ids })?;
        Ok(resp.instance_set)
    }

    fn stop_instance(&self, instance_id: &str) -> Result<(), ControlPlaneError> {
        let _: serde_json::Value = self.call("StopSandboxInstance", &InstanceIdBody { instance_id })?;
        Ok(())
    }

    fn acquire_token(&self, instance_id: &str) -> Result<TokenGrant, ControlPlaneError> {
        self.call("AcquireSandboxInstanceToken", &InstanceIdBody { instance_id })
    }
}
