//! Sandbox deployment lifecycle: provision a tool, start an instance, keep
//! its gateway credential fresh and hand a bound runtime to the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::DeploymentConfig;

use super::broker::CredentialBroker;
use super::control_plane::{ControlPlane, HttpControlPlane, InstanceInfo, InstanceStatus};
use super::error::DeploymentError;
use super::hooks::{CombinedDeploymentHook, DeploymentHook};
use super::launch;
use super::launcher::InstanceLauncher;
use super::runtime::{
    AgsRuntimeConnector, IsAliveResponse, RuntimeConnector, RuntimeHandle, RuntimeParams, TokenRefresher,
};
use super::template::TemplateProvisioner;
use super::token::TokenStore;
use super::waiter::{DEFAULT_BACKOFF, wait_until_alive};
use super::worker::offload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPhase {
    ProvisioningTemplate,
    LaunchingInstance,
    AcquiringCredential,
    WaitingForRuntime,
}

impl StartPhase {
    pub fn describe(&self) -> &'static str {
        match self {
            StartPhase::ProvisioningTemplate => "provisioning template",
            StartPhase::LaunchingInstance => "launching instance",
            StartPhase::AcquiringCredential => "acquiring credential",
            StartPhase::WaitingForRuntime => "waiting for runtime",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unstarted,
    /// Also the resting state after a failed `start()`, naming where it stopped.
    Starting(StartPhase),
    Ready,
    Stopping,
    Stopped,
}

/// One sandbox deployment, owned by a single caller.
///
/// `start` and `stop` take `&mut self`. `is_alive` and `ensure_valid_token`
/// take `&self` and may be called concurrently, including from the runtime
/// client's pre-request hook.
pub struct AgsDeployment {
    config: Arc<DeploymentConfig>,
    control_plane: Arc<dyn ControlPlane>,
    connector: Arc<dyn RuntimeConnector>,
    templates: TemplateProvisioner,
    launcher: InstanceLauncher,
    tokens: Arc<TokenStore>,
    hooks: CombinedDeploymentHook,
    liveness_backoff: Duration,

    state: LifecycleState,
    template_id: Option<String>,
    instance_id: Option<String>,
    endpoint: Option<String>,
    server_token: Option<String>,
    runtime: Option<Arc<dyn RuntimeHandle>>,
}

impl AgsDeployment {
    /// Deployment talking to the real control plane.
    pub fn new(config: DeploymentConfig) -> Result<Self, DeploymentError> {
        config.validate_credentials()?;
        let control_plane: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::from_config(&config));
        Self::with_parts(config, control_plane, Arc::new(AgsRuntimeConnector))
    }

    pub fn with_parts(
        config: DeploymentConfig,
        control_plane: Arc<dyn ControlPlane>,
        connector: Arc<dyn RuntimeConnector>,
    ) -> Result<Self, DeploymentError> {
        config.validate()?;
        let config = Arc::new(config);

        let templates = TemplateProvisioner::new(Arc::clone(&control_plane), Arc::clone(&config));
        let launcher = InstanceLauncher::new(
            Arc::clone(&control_plane),
            config.port,
            config.domain.clone(),
            config.timeout.clone(),
        );
        let tokens = Arc::new(TokenStore::new(
            CredentialBroker::new(Arc::clone(&control_plane)),
            config.token_refresh_threshold(),
        ));

        Ok(Self {
            config,
            control_plane,
            connector,
            templates,
            launcher,
            tokens,
            hooks: CombinedDeploymentHook::new(),
            liveness_backoff: DEFAULT_BACKOFF,
            state: LifecycleState::Unstarted,
            template_id: None,
            instance_id: None,
            endpoint: None,
            server_token: None,
            runtime: None,
        })
    }

    pub fn with_liveness_backoff(mut self, backoff: Duration) -> Self {
        self.liveness_backoff = backoff;
        self
    }

    pub fn add_hook(&mut self, hook: Box<dyn DeploymentHook>) {
        self.hooks.add_hook(hook);
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn template_id(&self) -> Option<&str> {
        self.template_id.as_deref()
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Token the execution server was started with. Empty while running.
    pub fn server_token(&self) -> Option<&str> {
        self.server_token.as_deref()
    }

    pub fn runtime(&self) -> Result<Arc<dyn RuntimeHandle>, DeploymentError> {
        self.runtime.clone().ok_or(DeploymentError::NotStarted)
    }

    /// Refresh capability to hand to other runtime clients.
    pub fn token_refresher(&self) -> Arc<dyn TokenRefresher> {
        self.tokens.clone()
    }

    pub async fn ensure_valid_token(&self) -> Result<String, DeploymentError> {
        self.tokens.ensure_valid_token().await
    }

    /// Instance must be RUNNING on the control plane and the execution
    /// server must answer its health probe.
    pub async fn is_alive(&self, timeout: Option<Duration>) -> Result<IsAliveResponse, DeploymentError> {
        let (Some(instance_id), Some(runtime)) = (&self.instance_id, &self.runtime) else {
            return Err(DeploymentError::NotStarted);
        };

        self.tokens.ensure_valid_token().await?;

        let instance = self.describe_instance(instance_id).await?;
        match instance.status {
            InstanceStatus::Running => {}
            InstanceStatus::Starting => {
                return Err(DeploymentError::InstanceNotReady {
                    id: instance_id.clone(),
                    status: instance.status.to_string(),
                });
            }
            status => {
                return Err(DeploymentError::InstanceNotRunning {
                    id: instance_id.clone(),
                    status: status.to_string(),
                });
            }
        }

        runtime.is_alive(timeout).await
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceInfo, DeploymentError> {
        let ids = vec![instance_id.to_string()];
        let instances = offload(&self.control_plane, move |cp| cp.describe_instances(&ids)).await?;
        instances
            .into_iter()
            .find(|i| i.instance_id == instance_id)
            .ok_or_else(|| DeploymentError::InstanceNotFound(instance_id.to_string()))
    }

    pub async fn start(&mut self) -> Result<(), DeploymentError> {
        if self.state == LifecycleState::Ready {
            tracing::warn!(
                instance_id = ?self.instance_id,
                "deployment already started, ignoring duplicate start"
            );
            return Ok(());
        }
        if self.instance_id.is_some() || self.runtime.is_some() {
            tracing::warn!(
                instance_id = ?self.instance_id,
                "cleaning up after an earlier failed start"
            );
            self.stop().await;
        }

        tracing::info!(image = %self.config.image, region = %self.config.region, "starting AGS sandbox");
        self.hooks.on_custom_step("Starting AGS sandbox");

        // Empty server token: access is guarded by the gateway token.
        let auth_token = String::new();
        self.server_token = Some(auth_token.clone());
        let started = Instant::now();

        self.state = LifecycleState::Starting(StartPhase::ProvisioningTemplate);
        let tool_id = self
            .templates
            .get_or_create(&self.config.image, &auth_token)
            .await
            .map_err(|e| self.abort(e))?;
        self.template_id = Some(tool_id.clone());
        tracing::info!(tool_id = %tool_id, "using sandbox tool");

        self.state = LifecycleState::Starting(StartPhase::LaunchingInstance);
        let override_config = self
            .config
            .tool_id
            .is_some()
            .then(|| launch::custom_configuration(&self.config, &self.config.image, &auth_token, false));
        let instance = self
            .launcher
            .start(&tool_id, override_config)
            .await
            .map_err(|e| self.abort(e))?;
        self.instance_id = Some(instance.id.clone());
        let elapsed_creation = started.elapsed();
        tracing::info!(
            instance_id = %instance.id,
            elapsed_ms = elapsed_creation.as_millis() as u64,
            "sandbox instance launched"
        );

        self.state = LifecycleState::Starting(StartPhase::AcquiringCredential);
        let credential = self
            .tokens
            .broker()
            .acquire(&instance.id)
            .await
            .map_err(|e| self.abort(e))?;
        let gateway_token = credential.token.clone();
        self.tokens.install(credential);

        tracing::info!(endpoint = %instance.endpoint, "sandbox endpoint");
        self.hooks.on_custom_step("Starting runtime");
        let refresher: Arc<dyn TokenRefresher> = self.tokens.clone();
        let runtime = self
            .connector
            .connect(
                RuntimeParams {
                    host: instance.endpoint.clone(),
                    gateway_token,
                    auth_token,
                    timeout: self.config.runtime_timeout(),
                },
                refresher,
            )
            .map_err(|e| self.abort(e))?;
        self.tokens.bind_runtime(&runtime);
        self.runtime = Some(runtime);
        self.endpoint = Some(instance.endpoint);

        self.state = LifecycleState::Starting(StartPhase::WaitingForRuntime);
        let remaining = self.config.startup_timeout().saturating_sub(elapsed_creation);
        let waiting = Instant::now();
        let this = &*self;
        wait_until_alive(
            move |budget| this.is_alive(Some(budget)),
            remaining,
            this.config.runtime_timeout(),
            this.liveness_backoff,
        )
        .await
        .map_err(|e| self.abort(e))?;

        self.state = LifecycleState::Ready;
        tracing::info!(
            instance_id = %instance.id,
            elapsed_ms = waiting.elapsed().as_millis() as u64,
            "runtime started"
        );
        Ok(())
    }

    fn abort(&self, error: DeploymentError) -> DeploymentError {
        let phase = match self.state {
            LifecycleState::Starting(phase) => phase.describe(),
            _ => "starting",
        };
        tracing::error!(phase, error = %error, "deployment start aborted");
        DeploymentError::StartAborted {
            phase,
            source: Box::new(error),
        }
    }

    /// Close the runtime and terminate the instance. Never fails: cleanup
    /// errors are logged and local state is cleared regardless. Safe to call
    /// repeatedly and after a failed `start()`.
    pub async fn stop(&mut self) {
        self.state = LifecycleState::Stopping;

        if let Some(runtime) = self.runtime.take() {
            if let Err(e) = runtime.close().await {
                tracing::warn!(error = %e, "failed to close runtime");
            }
        }
        self.tokens.clear();

        if let Some(instance_id) = self.instance_id.take() {
            tracing::info!(instance_id = %instance_id, "stopping sandbox instance");
            let id = instance_id.clone();
            match offload(&self.control_plane, move |cp| cp.stop_instance(&id)).await {
                Ok(()) => tracing::info!(instance_id = %instance_id, "sandbox instance stopped"),
                Err(e) => tracing::warn!(
                    instance_id = %instance_id,
                    error = %e,
                    "failed to stop sandbox instance"
                ),
            }
        }

        self.endpoint = None;
        self.server_token = None;
        self.state = LifecycleState::Stopped;
    }
}
