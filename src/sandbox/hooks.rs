/// Observer for progress messages emitted while a deployment starts.
pub trait DeploymentHook: Send + Sync {
    fn on_custom_step(&self, message: &str);
}

/// Forwards every message to each registered hook, in registration order.
#[derive(Default)]
pub struct CombinedDeploymentHook {
    hooks: Vec<Box<dyn DeploymentHook>>,
}

impl CombinedDeploymentHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&mut self, hook: Box<dyn DeploymentHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl DeploymentHook for CombinedDeploymentHook {
    fn on_custom_step(&self, message: &str) {
        for hook in &self.hooks {
            hook.on_custom_step(message);
        }
    }
}
