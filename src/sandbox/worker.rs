use std::sync::Arc;

use super::control_plane::{ControlPlane, ControlPlaneError};
use super::error::DeploymentError;

/// Run a blocking control-plane call on tokio's blocking pool.
///
/// The async caller is suspended until the worker finishes. A panic or
/// cancellation inside the worker surfaces as `DeploymentError::Worker`.
pub async fn offload<T, F>(control_plane: &Arc<dyn ControlPlane>, call: F) -> Result<T, DeploymentError>
where
    T: Send + 'static,
    F: FnOnce(&dyn ControlPlane) -> Result<T, ControlPlaneError> + Send + 'static,
{
    let control_plane = Arc::clone(control_plane);
    let result = tokio::task::spawn_blocking(move || call(control_plane.as_ref()))
        .await
        .map_err(|e| DeploymentError::Worker(format!("control plane worker failed: {e}")))?;
    Ok(result?)
}
