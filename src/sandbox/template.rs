use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::DeploymentConfig;

use super::control_plane::{ControlPlane, CreateToolRequest, NetworkConfiguration, ToolInfo, ToolStatus};
use super::error::DeploymentError;
use super::launch;
use super::worker::offload;

/// Makes sure an ACTIVE sandbox tool exists for the deployment.
pub struct TemplateProvisioner {
    control_plane: Arc<dyn ControlPlane>,
    config: Arc<DeploymentConfig>,
    poll_interval: Duration,
    ready_timeout: Duration,
}

impl TemplateProvisioner {
    pub fn new(control_plane: Arc<dyn ControlPlane>, config: Arc<DeploymentConfig>) -> Self {
        let poll_interval = config.tool_poll_interval();
        let ready_timeout = config.tool_ready_timeout();
        Self {
            control_plane,
            config,
            poll_interval,
            ready_timeout,
        }
    }

    pub fn with_polling(mut self, poll_interval: Duration, ready_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.ready_timeout = ready_timeout;
        self
    }

    /// Return the configured tool after checking it, or create a new one and
    /// wait for it to become ACTIVE.
    pub async fn get_or_create(&self, image: &str, auth_token: &str) -> Result<String, DeploymentError> {
        if let Some(tool_id) = &self.config.tool_id {
            tracing::info!(tool_id = %tool_id, "using existing sandbox tool");
            self.verify(tool_id).await?;
            return Ok(tool_id.clone());
        }

        let tool_id = self.create(image, auth_token).await?;
        self.wait_until_active(&tool_id).await?;
        Ok(tool_id)
    }

    /// Check that `tool_id` exists and is ACTIVE. No waiting, no repair.
    pub async fn verify(&self, tool_id: &str) -> Result<(), DeploymentError> {
        let tool = self.describe(tool_id).await?;
        match tool.status {
            ToolStatus::Active => {
                tracing::info!(tool_id = %tool_id, "sandbox tool verified");
                Ok(())
            }
            status => Err(DeploymentError::ToolNotActive {
                id: tool_id.to_string(),
                status: status.to_string(),
            }),
        }
    }

    async fn describe(&self, tool_id: &str) -> Result<ToolInfo, DeploymentError> {
        let ids = vec![tool_id.to_string()];
        let tools = offload(&self.control_plane, move |cp| cp.describe_tools(&ids)).await?;
        let mut matching = tools.into_iter().filter(|t| t.tool_id == tool_id);
        match (matching.next(), matching.next()) {
            (Some(tool), None) => Ok(tool),
            _ => Err(DeploymentError::ToolNotFound(tool_id.to_string())),
        }
    }

    async fn create(&self, image: &str, auth_token: &str) -> Result<String, DeploymentError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let req = CreateToolRequest {
            tool_name: format!("swerex-{}", &suffix[..8]),
            tool_type: "custom".into(),
            client_token: uuid::Uuid::new_v4().to_string(),
            network_configuration: NetworkConfiguration {
                network_mode: self.config.network_mode.clone(),
            },
            custom_configuration: launch::custom_configuration(&self.config, image, auth_token, true),
            role_arn: self.config.role_arn.clone(),
            storage_mounts: launch::storage_mounts(&self.config),
        };

        tracing::info!(tool_name = %req.tool_name, image = %image, "creating sandbox tool");
        let tool_id = offload(&self.control_plane, move |cp| cp.create_tool(&req)).await?;
        tracing::info!(tool_id = %tool_id, "sandbox tool created");
        Ok(tool_id)
    }

    /// Poll until ACTIVE. Only the describe call is repeated.
    async fn wait_until_active(&self, tool_id: &str) -> Result<(), DeploymentError> {
        tracing::info!(
            tool_id = %tool_id,
            timeout_secs = self.ready_timeout.as_secs_f64(),
            "waiting for sandbox tool to become ACTIVE"
        );
        let start = Instant::now();
        let deadline = start + self.ready_timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(DeploymentError::timeout(
                    format!("sandbox tool {tool_id} to become ACTIVE"),
                    start.elapsed(),
                ));
            }

            let tool = self.describe(tool_id).await?;
            match &tool.status {
                ToolStatus::Active => {
                    tracing::info!(
                        tool_id = %tool_id,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "sandbox tool is ACTIVE"
                    );
                    return Ok(());
                }
                ToolStatus::Failed => {
                    return Err(DeploymentError::ToolFailed {
                        id: tool_id.to_string(),
                        message: tool.failure_message().to_string(),
                    });
                }
                ToolStatus::Deleting => {
                    return Err(DeploymentError::ToolNotActive {
                        id: tool_id.to_string(),
                        status: tool.status.to_string(),
                    });
                }
                status => {
                    tracing::debug!(tool_id = %tool_id, status = %status, "sandbox tool not ready");
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}
