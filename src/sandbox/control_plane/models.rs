//! Request / response shapes for the Agent Sandbox control plane.
//!
//! Field names follow the provider's PascalCase JSON convention.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Status enums ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ToolStatus {
    Creating,
    Active,
    Failed,
    Deleting,
    Other(String),
}

impl From<String> for ToolStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "CREATING" => ToolStatus::Creating,
            "ACTIVE" => ToolStatus::Active,
            "FAILED" => ToolStatus::Failed,
            "DELETING" => ToolStatus::Deleting,
            _ => ToolStatus::Other(raw),
        }
    }
}

impl From<ToolStatus> for String {
    fn from(status: ToolStatus) -> Self {
        status.to_string()
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolStatus::Creating => f.write_str("CREATING"),
            ToolStatus::Active => f.write_str("ACTIVE"),
            ToolStatus::Failed => f.write_str("FAILED"),
            ToolStatus::Deleting => f.write_str("DELETING"),
            ToolStatus::Other(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Other(String),
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus::Other(String::new())
    }
}

impl From<String> for InstanceStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "STARTING" => InstanceStatus::Starting,
            "RUNNING" => InstanceStatus::Running,
            "STOPPING" => InstanceStatus::Stopping,
            "STOPPED" => InstanceStatus::Stopped,
            "FAILED" => InstanceStatus::Failed,
            _ => InstanceStatus::Other(raw),
        }
    }
}

impl From<InstanceStatus> for String {
    fn from(status: InstanceStatus) -> Self {
        status.to_string()
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Starting => f.write_str("STARTING"),
            InstanceStatus::Running => f.write_str("RUNNING"),
            InstanceStatus::Stopping => f.write_str("STOPPING"),
            InstanceStatus::Stopped => f.write_str("STOPPED"),
            InstanceStatus::Failed => f.write_str("FAILED"),
            InstanceStatus::Other(raw) => f.write_str(raw),
        }
    }
}

// ── Descriptors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ToolInfo {
    pub tool_id: String,
    pub status: ToolStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ToolInfo {
    /// Best available explanation for a FAILED tool.
    pub fn failure_message(&self) -> &str {
        self.status_message
            .as_deref()
            .filter(|m| !m.is_empty())
            .or(self.message.as_deref().filter(|m| !m.is_empty()))
            .unwrap_or("Unknown error")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceInfo {
    pub instance_id: String,
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub status: InstanceStatus,
}

/// Gateway token as returned by the provider. `expires_at` is left raw;
/// the token store owns parsing and its fallback policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: String,
}

// ── Requests ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateToolRequest {
    pub tool_name: String,
    pub tool_type: String,
    pub client_token: String,
    pub network_configuration: NetworkConfiguration,
    pub custom_configuration: CustomConfiguration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_mounts: Option<Vec<StorageMount>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartInstanceRequest {
    pub tool_id: String,
    pub client_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_configuration: Option<CustomConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkConfiguration {
    pub network_mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomConfiguration {
    pub image: String,
    pub image_registry_type: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub ports: Vec<PortConfiguration>,
    pub resources: ResourceConfiguration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortConfiguration {
    pub name: String,
    pub port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceConfiguration {
    #[serde(rename = "CPU")]
    pub cpu: String,
    #[serde(rename = "Memory")]
    pub memory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProbeConfiguration {
    pub http_get: HttpGetAction,
    pub ready_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_period_ms: u64,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpGetAction {
    pub path: String,
    pub port: u16,
    pub scheme: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StorageMount {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
    pub storage_source: StorageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StorageSource {
    pub image: ImageStorageSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageStorageSource {
    pub reference: String,
    pub image_registry_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

// ── Response envelopes ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct CreateToolResponse {
    pub tool_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DescribeToolsResponse {
    #[serde(default)]
    pub sandbox_tool_set: Vec<ToolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct StartInstanceResponse {
    pub instance: InstanceInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DescribeInstancesResponse {
    #[serde(default)]
    pub instance_set: Vec<InstanceInfo>,
}
