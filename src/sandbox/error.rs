use std::time::Duration;

use super::control_plane::ControlPlaneError;

/// Errors from deployment lifecycle operations.
///
/// `is_fatal()` decides whether the liveness waiter keeps retrying: terminal
/// provider states and missing prerequisites that cannot resolve themselves
/// are fatal, everything else is treated as transient.
#[derive(thiserror::Error, Debug)]
pub enum DeploymentError {
    #[error("deployment not started")]
    NotStarted,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("control plane: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("sandbox tool {0} not found")]
    ToolNotFound(String),

    #[error("sandbox tool {id} is not ACTIVE (status: {status})")]
    ToolNotActive { id: String, status: String },

    #[error("sandbox tool {id} creation failed: {message}")]
    ToolFailed { id: String, message: String },

    #[error("sandbox instance {0} not found")]
    InstanceNotFound(String),

    #[error("sandbox instance {id} is not ready yet: {status}")]
    InstanceNotReady { id: String, status: String },

    #[error("sandbox instance {id} is not running: {status}")]
    InstanceNotRunning { id: String, status: String },

    #[error("credential for instance {actual} does not belong to instance {expected}")]
    CredentialMismatch { expected: String, actual: String },

    #[error("runtime: {0}")]
    Runtime(String),

    #[error("timed out after {:.1}s waiting for {operation}{}", .elapsed.as_secs_f64(), last_error_suffix(.last_error))]
    Timeout {
        operation: String,
        elapsed: Duration,
        last_error: Option<String>,
    },

    #[error("worker: {0}")]
    Worker(String),

    #[error("start aborted while {phase}: {source}")]
    StartAborted {
        phase: &'static str,
        #[source]
        source: Box<DeploymentError>,
    },
}

impl DeploymentError {
    /// Whether retrying the failed operation can ever succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            DeploymentError::InstanceNotRunning { .. }
            | DeploymentError::ToolFailed { .. }
            | DeploymentError::ToolNotActive { .. }
            | DeploymentError::ToolNotFound(_)
            | DeploymentError::CredentialMismatch { .. }
            | DeploymentError::Config(_) => true,
            DeploymentError::StartAborted { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        DeploymentError::Timeout {
            operation: operation.into(),
            elapsed,
            last_error: None,
        }
    }
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}
