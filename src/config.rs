use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::sandbox::DeploymentError;

/// Process settings loaded from environment variables.
pub struct Config {
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("AGS_DEPLOY_CONFIG").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        sentry_dsn: Option<&str>,
        environment: Option<&str>,
        config_path: Option<&str>,
    ) -> Self {
        let sentry_dsn = sentry_dsn.filter(|s| !s.is_empty()).map(String::from);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        let config_path = config_path.filter(|s| !s.is_empty()).map(PathBuf::from);

        Config {
            sentry_dsn,
            environment,
            config_path,
        }
    }
}

/// `~/.config/ags-deploy/config.yaml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ags-deploy").join("config.yaml"))
}

// --- Deployment settings ---

/// Everything needed to provision and run one sandbox deployment.
///
/// Timeouts are in seconds. Every field has a default, so an empty YAML
/// document is a valid (if credential-less) configuration.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploymentConfig {
    pub secret_id: String,
    pub secret_key: String,
    pub region: String,
    pub http_endpoint: String,
    pub skip_ssl_verify: bool,
    pub domain: String,

    pub image: String,
    pub image_registry_type: String,
    /// Existing tool to reuse instead of creating one.
    pub tool_id: Option<String>,
    pub port: u16,
    pub cpu: String,
    pub memory: String,
    pub network_mode: String,
    pub role_arn: Option<String>,

    pub mount_image: Option<String>,
    pub mount_image_registry_type: String,
    pub mount_name: Option<String>,
    pub mount_path: Option<String>,
    pub mount_readonly: bool,
    pub image_subpath: Option<String>,

    /// Instance lifetime passed to the provider, e.g. `"1h"`.
    pub timeout: Option<String>,
    pub startup_timeout: f64,
    pub runtime_timeout: f64,
    pub tool_ready_timeout: f64,
    pub tool_poll_interval: f64,
    pub token_refresh_threshold: f64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            secret_id: String::new(),
            secret_key: String::new(),
            region: "ap-guangzhou".to_string(),
            http_endpoint: "ags.tencentcloudapi.com".to_string(),
            skip_ssl_verify: false,
            domain: "ap-guangzhou.tencentags.com".to_string(),
            image: "python:3.11".to_string(),
            image_registry_type: "enterprise".to_string(),
            tool_id: None,
            port: 8000,
            cpu: "2".to_string(),
            memory: "4Gi".to_string(),
            network_mode: "PUBLIC".to_string(),
            role_arn: None,
            mount_image: None,
            mount_image_registry_type: "enterprise".to_string(),
            mount_name: None,
            mount_path: None,
            mount_readonly: true,
            image_subpath: None,
            timeout: None,
            startup_timeout: 180.0,
            runtime_timeout: 60.0,
            tool_ready_timeout: 300.0,
            tool_poll_interval: 2.0,
            token_refresh_threshold: 60.0,
        }
    }
}

impl std::fmt::Debug for DeploymentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentConfig")
            .field("secret_id", &self.secret_id)
            .field("region", &self.region)
            .field("domain", &self.domain)
            .field("image", &self.image)
            .field("tool_id", &self.tool_id)
            .field("port", &self.port)
            .field("startup_timeout", &self.startup_timeout)
            .finish_non_exhaustive()
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl DeploymentConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, DeploymentError> {
        serde_yaml::from_str(content)
            .map_err(|e| DeploymentError::Config(format!("failed to parse deployment config: {e}")))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, DeploymentError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeploymentError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_overrides(|key| std::env::var(key).ok());
    }

    /// Overlay values from `lookup`. Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("TENCENTCLOUD_SECRET_ID") {
            self.secret_id = v;
        }
        if let Some(v) = get("TENCENTCLOUD_SECRET_KEY") {
            self.secret_key = v;
        }
        if let Some(v) = get("AGS_REGION") {
            self.region = v;
        }
        if let Some(v) = get("AGS_DOMAIN") {
            self.domain = v;
        }
        if let Some(v) = get("AGS_IMAGE") {
            self.image = v;
        }
        if let Some(v) = get("AGS_TOOL_ID") {
            self.tool_id = Some(v);
        }
    }

    /// Reject settings that would only fail later, mid-deployment.
    pub fn validate(&self) -> Result<(), DeploymentError> {
        if self.image.trim().is_empty() {
            return Err(DeploymentError::Config("image must not be empty".into()));
        }
        if self.port == 0 {
            return Err(DeploymentError::Config("port must be non-zero".into()));
        }
        if self.domain.trim().is_empty() {
            return Err(DeploymentError::Config("domain must not be empty".into()));
        }
        if matches!(&self.tool_id, Some(id) if id.trim().is_empty()) {
            return Err(DeploymentError::Config("tool_id must not be blank".into()));
        }

        for (name, value) in [
            ("startup_timeout", self.startup_timeout),
            ("runtime_timeout", self.runtime_timeout),
            ("tool_ready_timeout", self.tool_ready_timeout),
            ("token_refresh_threshold", self.token_refresh_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(DeploymentError::Config(format!(
                    "{name} must be a non-negative number of seconds, got {value}"
                )));
            }
        }
        if !self.tool_poll_interval.is_finite() || self.tool_poll_interval <= 0.0 {
            return Err(DeploymentError::Config(format!(
                "tool_poll_interval must be positive, got {}",
                self.tool_poll_interval
            )));
        }

        if self.mount_image.is_some() && (self.mount_name.is_none() || self.mount_path.is_none()) {
            return Err(DeploymentError::Config(
                "mount_image requires mount_name and mount_path".into(),
            ));
        }
        Ok(())
    }

    /// Control-plane calls are signed, so both halves of the key are required.
    pub fn validate_credentials(&self) -> Result<(), DeploymentError> {
        if self.secret_id.is_empty() || self.secret_key.is_empty() {
            return Err(DeploymentError::Config(
                "secret_id and secret_key are required (or TENCENTCLOUD_SECRET_ID / TENCENTCLOUD_SECRET_KEY)"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Mount settings, present only when a storage image is configured.
    pub fn mount(&self) -> Option<(&str, &str, &str)> {
        match (&self.mount_image, &self.mount_name, &self.mount_path) {
            (Some(image), Some(name), Some(path)) => Some((image, name, path)),
            _ => None,
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        secs(self.startup_timeout)
    }

    pub fn runtime_timeout(&self) -> Duration {
        secs(self.runtime_timeout)
    }

    pub fn tool_ready_timeout(&self) -> Duration {
        secs(self.tool_ready_timeout)
    }

    pub fn tool_poll_interval(&self) -> Duration {
        secs(self.tool_poll_interval)
    }

    pub fn token_refresh_threshold(&self) -> Duration {
        secs(self.token_refresh_threshold)
    }
}
