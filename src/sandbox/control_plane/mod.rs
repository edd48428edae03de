//! Control-plane surface for Agent Sandbox tools and instances.
//!
//! Every method is a blocking RPC. Async callers go through
//! [`crate::sandbox::worker::offload`].

pub mod client;
pub mod models;
mod signing;

pub use client::HttpControlPlane;
pub use models::*;

/// Errors surfaced by a control-plane call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("{code}: {message} (request id: {request_id})")]
    Api {
        code: String,
        message: String,
        request_id: String,
    },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Blocking control-plane operations the deployment depends on.
///
/// Shared across worker threads behind an `Arc` for the deployment's lifetime.
pub trait ControlPlane: Send + Sync {
    /// Submit a tool creation request. Returns the new tool id.
    fn create_tool(&self, req: &CreateToolRequest) -> Result<String, ControlPlaneError>;

    /// Describe tools by id. Unknown ids are simply absent from the result.
    fn describe_tools(&self, tool_ids: &[String]) -> Result<Vec<ToolInfo>, ControlPlaneError>;

    /// Start an instance from a tool. Returns as soon as an id is assigned.
    fn start_instance(&self, req: &StartInstanceRequest) -> Result<InstanceInfo, ControlPlaneError>;

    /// Describe instances by id.
    fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceInfo>, ControlPlaneError>;

    fn stop_instance(&self, instance_id: &str) -> Result<(), ControlPlaneError>;

    /// Mint a gateway access token scoped to one instance.
    fn acquire_token(&self, instance_id: &str) -> Result<TokenGrant, ControlPlaneError>;
}
