use std::sync::Arc;

use super::control_plane::ControlPlane;
use super::error::DeploymentError;
use super::token::Credential;
use super::worker::offload;

/// Mints instance-scoped gateway credentials.
///
/// No retries here: a failed acquisition is returned as-is and the caller
/// decides whether to try again.
#[derive(Clone)]
pub struct CredentialBroker {
    control_plane: Arc<dyn ControlPlane>,
}

impl CredentialBroker {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }

    pub async fn acquire(&self, instance_id: &str) -> Result<Credential, DeploymentError> {
        let id = instance_id.to_string();
        let grant = offload(&self.control_plane, move |cp| cp.acquire_token(&id)).await?;
        let credential = Credential::from_grant(grant, instance_id);
        tracing::debug!(
            instance_id = %instance_id,
            expires_at = %credential.expires_at,
            "acquired gateway token"
        );
        Ok(credential)
    }
}
