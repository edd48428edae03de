//! Container configuration shared by tool creation and instance overrides.

use crate::config::DeploymentConfig;

use super::control_plane::{
    CustomConfiguration, HttpGetAction, ImageStorageSource, PortConfiguration, ProbeConfiguration,
    ResourceConfiguration, StorageMount, StorageSource,
};

const REMOTE_EXECUTABLE: &str = "swerex-remote";
const PACKAGE_NAME: &str = "swe-rex";
const PIPX_SETUP: &str = "python3 -m pip install pipx && python3 -m pipx ensurepath";

/// Shell line that starts the execution server on `port`.
///
/// Tries, in order: the launcher shipped on the storage mount (when one is
/// configured), an installed `swerex-remote`, and finally a pipx install.
pub fn server_start_command(config: &DeploymentConfig, auth_token: &str) -> String {
    let args = format!("--port {} --auth-token '{}'", config.port, auth_token);
    let pipx = format!("({PIPX_SETUP} && pipx run {PACKAGE_NAME} {args})");

    match (&config.mount_image, &config.mount_path) {
        (Some(_), Some(mount_path)) => {
            let launcher = format!("{}/swerex/run-swerex", mount_path.trim_end_matches('/'));
            format!("{launcher} {args} || {REMOTE_EXECUTABLE} {args} || {pipx}")
        }
        _ => format!("{REMOTE_EXECUTABLE} {args} || {pipx}"),
    }
}

/// Container spec for the execution image. The HTTP readiness probe is only
/// attached at tool creation; instance overrides leave the tool's probe alone.
pub fn custom_configuration(
    config: &DeploymentConfig,
    image: &str,
    auth_token: &str,
    with_probe: bool,
) -> CustomConfiguration {
    CustomConfiguration {
        image: image.to_string(),
        image_registry_type: config.image_registry_type.clone(),
        command: vec!["/bin/sh".into(), "-c".into()],
        args: vec![server_start_command(config, auth_token)],
        ports: vec![PortConfiguration {
            name: "http".into(),
            port: config.port,
            protocol: "TCP".into(),
        }],
        resources: ResourceConfiguration {
            cpu: config.cpu.clone(),
            memory: config.memory.clone(),
        },
        probe: with_probe.then(|| readiness_probe(config.port)),
    }
}

fn readiness_probe(port: u16) -> ProbeConfiguration {
    ProbeConfiguration {
        http_get: HttpGetAction {
            path: "/".into(),
            port,
            scheme: "HTTP".into(),
        },
        ready_timeout_ms: 30_000,
        probe_timeout_ms: 1_000,
        probe_period_ms: 2_000,
        success_threshold: 1,
        failure_threshold: 15,
    }
}

/// Storage mount for the configured tool image, if any.
pub fn storage_mounts(config: &DeploymentConfig) -> Option<Vec<StorageMount>> {
    let (image, name, path) = config.mount()?;
    Some(vec![StorageMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: config.mount_readonly,
        storage_source: StorageSource {
            image: ImageStorageSource {
                reference: image.to_string(),
                image_registry_type: config.mount_image_registry_type.clone(),
                sub_path: config.image_subpath.clone(),
            },
        },
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounted() -> DeploymentConfig {
        DeploymentConfig {
            mount_image: Some("ccr.example/swerex:1".into()),
            mount_name: Some("swerex".into()),
            mount_path: Some("/mnt/tools/".into()),
            image_subpath: Some("bin".into()),
            ..DeploymentConfig::default()
        }
    }

    #[test]
    fn start_command_without_mount() {
        let cmd = server_start_command(&DeploymentConfig::default(), "");
        assert_eq!(
            cmd,
            "swerex-remote --port 8000 --auth-token '' || (python3 -m pip install pipx && python3 -m pipx ensurepath && pipx run swe-rex --port 8000 --auth-token '')"
        );
    }

    #[test]
    fn start_command_prefers_mounted_launcher() {
        let cmd = server_start_command(&mounted(), "");
        assert!(cmd.starts_with("/mnt/tools/swerex/run-swerex --port 8000 --auth-token '' || swerex-remote"));
        assert!(cmd.ends_with("pipx run swe-rex --port 8000 --auth-token '')"));
    }

    #[test]
    fn creation_config_has_probe_on_service_port() {
        let config = DeploymentConfig {
            port: 9000,
            ..DeploymentConfig::default()
        };
        let custom = custom_configuration(&config, "python:3.12", "", true);
        assert_eq!(custom.image, "python:3.12");
        assert_eq!(custom.command, ["/bin/sh", "-c"]);
        assert_eq!(custom.ports[0].port, 9000);
        let probe = custom.probe.unwrap();
        assert_eq!(probe.http_get.port, 9000);
        assert_eq!(probe.failure_threshold, 15);
    }

    #[test]
    fn override_config_has_no_probe() {
        let custom = custom_configuration(&DeploymentConfig::default(), "python:3.11", "", false);
        assert!(custom.probe.is_none());
        assert_eq!(custom.resources.cpu, "2");
        assert_eq!(custom.resources.memory, "4Gi");
    }

    #[test]
    fn storage_mount_requires_full_mount_settings() {
        assert!(storage_mounts(&DeploymentConfig::default()).is_none());

        let mounts = storage_mounts(&mounted()).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, "swerex");
        assert!(mounts[0].read_only);
        assert_eq!(mounts[0].storage_source.image.reference, "ccr.example/swerex:1");
        assert_eq!(mounts[0].storage_source.image.sub_path.as_deref(), Some("bin"));
    }
}
