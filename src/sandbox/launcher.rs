use std::sync::Arc;

use super::control_plane::{ControlPlane, ControlPlaneError, CustomConfiguration, InstanceStatus, StartInstanceRequest};
use super::error::DeploymentError;
use super::worker::offload;

/// A freshly started instance and where its execution server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub id: String,
    pub status: InstanceStatus,
    pub endpoint: String,
}

/// Gateway address of a port on an instance.
pub fn endpoint_for(port: u16, instance_id: &str, domain: &str) -> String {
    format!("https://{port}-{instance_id}.{domain}")
}

/// Starts sandbox instances from an ACTIVE tool. Does not wait for them.
pub struct InstanceLauncher {
    control_plane: Arc<dyn ControlPlane>,
    port: u16,
    domain: String,
    lifetime: Option<String>,
}

impl InstanceLauncher {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        port: u16,
        domain: impl Into<String>,
        lifetime: Option<String>,
    ) -> Self {
        Self {
            control_plane,
            port,
            domain: domain.into(),
            lifetime,
        }
    }

    pub async fn start(
        &self,
        tool_id: &str,
        override_config: Option<CustomConfiguration>,
    ) -> Result<InstanceDescriptor, DeploymentError> {
        if let Some(custom) = &override_config {
            tracing::info!(image = %custom.image, "overriding tool config for instance");
        }
        let req = StartInstanceRequest {
            tool_id: tool_id.to_string(),
            client_token: uuid::Uuid::new_v4().to_string(),
            timeout: self.lifetime.clone(),
            custom_configuration: override_config,
        };

        tracing::info!(tool_id = %tool_id, "starting sandbox instance");
        let instance = offload(&self.control_plane, move |cp| cp.start_instance(&req)).await?;
        if instance.instance_id.is_empty() {
            return Err(ControlPlaneError::Malformed(
                "StartSandboxInstance returned no instance id".into(),
            )
            .into());
        }

        let endpoint = endpoint_for(self.port, &instance.instance_id, &self.domain);
        tracing::info!(
            instance_id = %instance.instance_id,
            status = %instance.status,
            endpoint = %endpoint,
            "sandbox instance started"
        );
        Ok(InstanceDescriptor {
            id: instance.instance_id,
            status: instance.status,
            endpoint,
        })
    }
}
