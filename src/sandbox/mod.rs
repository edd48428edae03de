pub mod broker;
pub mod control_plane;
pub mod deployment;
pub mod error;
pub mod hooks;
pub mod launch;
pub mod launcher;
pub mod runtime;
pub mod template;
pub mod token;
pub mod waiter;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::CredentialBroker;
pub use control_plane::{ControlPlane, ControlPlaneError, HttpControlPlane};
pub use deployment::{AgsDeployment, LifecycleState, StartPhase};
pub use error::DeploymentError;
pub use hooks::{CombinedDeploymentHook, DeploymentHook};
pub use launcher::{InstanceDescriptor, InstanceLauncher};
pub use runtime::{
    AgsRuntime, AgsRuntimeConnector, Command, CommandLine, CommandResponse, IsAliveResponse, RuntimeConnector,
    RuntimeHandle, TokenRefresher,
};
pub use template::TemplateProvisioner;
pub use token::{Credential, TokenStore};
pub use waiter::wait_until_alive;

use crate::config::DeploymentConfig;

/// Build a deployment against the real control plane from config.
pub fn build_deployment(config: DeploymentConfig) -> Result<AgsDeployment, DeploymentError> {
    tracing::info!(
        region = %config.region,
        domain = %config.domain,
        tool_id = ?config.tool_id,
        "initializing AGS deployment"
    );
    AgsDeployment::new(config)
}
