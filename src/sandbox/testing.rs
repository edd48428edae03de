//! In-memory fakes for the control plane and the runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::control_plane::*;
use super::error::DeploymentError;
use super::runtime::{
    Command, CommandLine, CommandResponse, IsAliveResponse, RuntimeConnector, RuntimeHandle, RuntimeParams,
    TokenRefresher,
};

pub(crate) const FAKE_TOOL_ID: &str = "sdt-fake-1";

// ── Control plane ───────────────────────────────────────────────────

pub(crate) struct FakeControlPlane {
    tool_script: Mutex<VecDeque<ToolStatus>>,
    tool_message: Option<String>,
    missing_tools: bool,
    instance_status: Mutex<InstanceStatus>,
    missing_instances: AtomicBool,
    stop_error: Option<ControlPlaneError>,
    acquire_error: Option<String>,
    acquire_delay: Duration,
    start_delay: Duration,
    raw_expiry: Option<String>,
    token_ttl: chrono::Duration,

    create_tool_calls: AtomicUsize,
    describe_tool_calls: AtomicUsize,
    start_calls: AtomicUsize,
    describe_instance_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    acquire_calls: AtomicUsize,
    created: Mutex<Vec<CreateToolRequest>>,
    started: Mutex<Vec<StartInstanceRequest>>,
}

impl FakeControlPlane {
    pub(crate) fn new() -> Self {
        Self {
            tool_script: Mutex::new(VecDeque::from([ToolStatus::Active])),
            tool_message: None,
            missing_tools: false,
            instance_status: Mutex::new(InstanceStatus::Running),
            missing_instances: AtomicBool::new(false),
            stop_error: None,
            acquire_error: None,
            acquire_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
            raw_expiry: None,
            token_ttl: chrono::Duration::hours(1),
            create_tool_calls: AtomicUsize::new(0),
            describe_tool_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            describe_instance_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            acquire_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Statuses returned by successive describe calls; the last one repeats.
    pub(crate) fn with_tool_statuses(self, statuses: impl IntoIterator<Item = ToolStatus>) -> Self {
        *self.tool_script.lock().unwrap() = statuses.into_iter().collect();
        self
    }

    pub(crate) fn with_tool_message(mut self, message: &str) -> Self {
        self.tool_message = Some(message.to_string());
        self
    }

    pub(crate) fn with_missing_tools(mut self) -> Self {
        self.missing_tools = true;
        self
    }

    pub(crate) fn with_instance_status(self, status: InstanceStatus) -> Self {
        self.set_instance_status(status);
        self
    }

    pub(crate) fn with_stop_error(mut self, message: &str) -> Self {
        self.stop_error = Some(ControlPlaneError::Transport(message.to_string()));
        self
    }

    pub(crate) fn with_acquire_error(mut self, code: &str) -> Self {
        self.acquire_error = Some(code.to_string());
        self
    }

    pub(crate) fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    pub(crate) fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub(crate) fn with_raw_expiry(mut self, raw: &str) -> Self {
        self.raw_expiry = Some(raw.to_string());
        self
    }

    pub(crate) fn with_token_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub(crate) fn set_instance_status(&self, status: InstanceStatus) {
        *self.instance_status.lock().unwrap() = status;
    }

    pub(crate) fn set_missing_instances(&self, missing: bool) {
        self.missing_instances.store(missing, Ordering::SeqCst);
    }

    pub(crate) fn create_tool_calls(&self) -> usize {
        self.create_tool_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn describe_tool_calls(&self) -> usize {
        self.describe_tool_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn describe_instance_calls(&self) -> usize {
        self.describe_instance_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn created(&self) -> Vec<CreateToolRequest> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn started(&self) -> Vec<StartInstanceRequest> {
        self.started.lock().unwrap().clone()
    }

    fn next_tool_status(&self) -> ToolStatus {
        let mut script = self.tool_script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap_or(ToolStatus::Active)
        } else {
            script.front().cloned().unwrap_or(ToolStatus::Active)
        }
    }
}

impl ControlPlane for FakeControlPlane {
    fn create_tool(&self, req: &CreateToolRequest) -> Result<String, ControlPlaneError> {
        self.create_tool_calls.fetch_add(1, Ordering::SeqCst);
        self.created.lock().unwrap().push(req.clone());
        Ok(FAKE_TOOL_ID.to_string())
    }

    fn describe_tools(&self, tool_ids: &[String]) -> Result<Vec<ToolInfo>, ControlPlaneError> {
        self.describe_tool_calls.fetch_add(1, Ordering::SeqCst);
        if self.missing_tools {
            return Ok(Vec::new());
        }
        let status = self.next_tool_status();
        let status_message = match status {
            ToolStatus::Failed => self.tool_message.clone(),
            _ => None,
        };
        Ok(tool_ids
            .iter()
            .map(|id| ToolInfo {
                tool_id: id.clone(),
                status: status.clone(),
                status_message: status_message.clone(),
                message: None,
            })
            .collect())
    }

    fn start_instance(&self, req: &StartInstanceRequest) -> Result<InstanceInfo, ControlPlaneError> {
        let n = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.start_delay.is_zero() {
            std::thread::sleep(self.start_delay);
        }
        self.started.lock().unwrap().push(req.clone());
        Ok(InstanceInfo {
            instance_id: format!("sbi-fake-{n}"),
            tool_id: Some(req.tool_id.clone()),
            status: InstanceStatus::Starting,
        })
    }

    fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<InstanceInfo>, ControlPlaneError> {
        self.describe_instance_calls.fetch_add(1, Ordering::SeqCst);
        if self.missing_instances.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let status = self.instance_status.lock().unwrap().clone();
        Ok(instance_ids
            .iter()
            .map(|id| InstanceInfo {
                instance_id: id.clone(),
                tool_id: Some(FAKE_TOOL_ID.to_string()),
                status: status.clone(),
            })
            .collect())
    }

    fn stop_instance(&self, _instance_id: &str) -> Result<(), ControlPlaneError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        match &self.stop_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn acquire_token(&self, instance_id: &str) -> Result<TokenGrant, ControlPlaneError> {
        let n = self.acquire_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.acquire_delay.is_zero() {
            std::thread::sleep(self.acquire_delay);
        }
        if let Some(code) = &self.acquire_error {
            return Err(ControlPlaneError::Api {
                code: code.clone(),
                message: "injected failure".into(),
                request_id: format!("req-{n}"),
            });
        }
        let expires_at = match &self.raw_expiry {
            Some(raw) => raw.clone(),
            None => (chrono::Utc::now() + self.token_ttl).to_rfc3339(),
        };
        Ok(TokenGrant {
            token: format!("tok-{instance_id}-{n}"),
            expires_at,
        })
    }
}

// ── Runtime ─────────────────────────────────────────────────────────

pub(crate) struct FakeRuntime {
    gateway_token: Mutex<String>,
    not_alive_left: AtomicUsize,
    refresher: Option<Arc<dyn TokenRefresher>>,
    probe_calls: AtomicUsize,
    executed: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
    fail_close: bool,
}

impl FakeRuntime {
    pub(crate) fn new(token: &str) -> Self {
        Self {
            gateway_token: Mutex::new(token.to_string()),
            not_alive_left: AtomicUsize::new(0),
            refresher: None,
            probe_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            fail_close: false,
        }
    }

    pub(crate) fn gateway_token(&self) -> String {
        self.gateway_token.lock().unwrap().clone()
    }

    pub(crate) fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Not alive until the configured number of probes has been answered.
    fn next_answer(&self) -> IsAliveResponse {
        let booting = self
            .not_alive_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if booting {
            IsAliveResponse::not_alive("server booting")
        } else {
            IsAliveResponse::alive()
        }
    }
}

#[async_trait]
impl RuntimeHandle for FakeRuntime {
    async fn is_alive(&self, _timeout: Option<Duration>) -> Result<IsAliveResponse, DeploymentError> {
        if let Some(refresher) = &self.refresher {
            let token = refresher.ensure_valid_token().await?;
            self.set_gateway_token(&token);
        }
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_answer())
    }

    /// Echoes the command line back as stdout.
    async fn execute(&self, command: &Command) -> Result<CommandResponse, DeploymentError> {
        let line = match &command.command {
            CommandLine::Shell(line) => line.clone(),
            CommandLine::Argv(argv) => argv.join(" "),
        };
        self.executed.lock().unwrap().push(line.clone());
        Ok(CommandResponse {
            stdout: line,
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    fn set_gateway_token(&self, token: &str) {
        *self.gateway_token.lock().unwrap() = token.to_string();
    }

    async fn close(&self) -> Result<(), DeploymentError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(DeploymentError::Runtime("connection reset".into()));
        }
        Ok(())
    }
}

/// Hands out [`FakeRuntime`]s and keeps them for inspection.
#[derive(Default)]
pub(crate) struct FakeConnector {
    not_alive_first: usize,
    fail_close: bool,
    connected: Mutex<Vec<(RuntimeParams, Arc<FakeRuntime>)>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every runtime reports not alive for its first `probes` probes.
    pub(crate) fn with_not_alive_probes(mut self, probes: usize) -> Self {
        self.not_alive_first = probes;
        self
    }

    pub(crate) fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub(crate) fn connections(&self) -> usize {
        self.connected.lock().unwrap().len()
    }

    pub(crate) fn last_params(&self) -> Option<RuntimeParams> {
        self.connected.lock().unwrap().last().map(|(p, _)| p.clone())
    }

    pub(crate) fn runtime_at(&self, index: usize) -> Option<Arc<FakeRuntime>> {
        self.connected.lock().unwrap().get(index).map(|(_, r)| Arc::clone(r))
    }

    pub(crate) fn last_runtime(&self) -> Option<Arc<FakeRuntime>> {
        self.connected.lock().unwrap().last().map(|(_, r)| Arc::clone(r))
    }
}

impl RuntimeConnector for FakeConnector {
    fn connect(
        &self,
        params: RuntimeParams,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Arc<dyn RuntimeHandle>, DeploymentError> {
        let runtime = Arc::new(FakeRuntime {
            gateway_token: Mutex::new(params.gateway_token.clone()),
            not_alive_left: AtomicUsize::new(self.not_alive_first),
            refresher: Some(refresher),
            probe_calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            fail_close: self.fail_close,
        });
        self.connected
            .lock()
            .unwrap()
            .push((params, Arc::clone(&runtime)));
        Ok(runtime)
    }
}
