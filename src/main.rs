use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ags_deploy::config::{self, Config, DeploymentConfig};
use ags_deploy::sandbox::{self, AgsDeployment, DeploymentHook, HttpControlPlane, TemplateProvisioner};

#[derive(Parser)]
#[command(name = "ags-deploy", about = "Run execution sandboxes on Tencent Cloud Agent Sandbox")]
struct Cli {
    /// Deployment config file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start a sandbox, print its endpoint and keep it until Ctrl-C
    Up,
    /// Start a sandbox, report liveness and stop it again
    Check,
    /// Check that an existing sandbox tool is ACTIVE
    VerifyTool {
        tool_id: String,
    },
}

/// Prints start-up progress to stderr.
struct ConsoleHook;

impl DeploymentHook for ConsoleHook {
    fn on_custom_step(&self, message: &str) {
        eprintln!("==> {message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let settings = Config::from_env();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ags_deploy=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        settings.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(settings.environment.clone().into()),
            enable_logs: true,
            ..Default::default()
        },
    ));

    let deployment_config = load_deployment_config(cli.config.or(settings.config_path))?;

    match cli.command {
        Command::Up => up(deployment_config).await,
        Command::Check => check(deployment_config).await,
        Command::VerifyTool { tool_id } => verify_tool(deployment_config, &tool_id).await,
    }
}

/// Explicit path, else the default location if it exists, else defaults.
/// Environment variables are applied on top.
fn load_deployment_config(path: Option<PathBuf>) -> Result<DeploymentConfig> {
    let path = path.or_else(|| config::default_config_path().filter(|p| p.exists()));
    let mut deployment_config = match &path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading deployment config");
            DeploymentConfig::from_yaml_file(path)?
        }
        None => DeploymentConfig::default(),
    };
    deployment_config.apply_env();
    deployment_config
        .validate()
        .context("invalid deployment config")?;
    Ok(deployment_config)
}

fn deployment(deployment_config: DeploymentConfig) -> Result<AgsDeployment> {
    let mut deployment =
        sandbox::build_deployment(deployment_config).context("failed to set up deployment")?;
    deployment.add_hook(Box::new(ConsoleHook));
    Ok(deployment)
}

async fn up(deployment_config: DeploymentConfig) -> Result<()> {
    let mut deployment = deployment(deployment_config)?;

    if let Err(e) = deployment.start().await {
        deployment.stop().await;
        return Err(e).context("failed to start sandbox");
    }

    println!("instance: {}", deployment.instance_id().unwrap_or_default());
    println!("endpoint: {}", deployment.endpoint().unwrap_or_default());
    eprintln!("sandbox is running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");
    deployment.stop().await;
    Ok(())
}

async fn check(deployment_config: DeploymentConfig) -> Result<()> {
    let mut deployment = deployment(deployment_config)?;

    let result = async {
        deployment.start().await?;
        deployment.is_alive(Some(Duration::from_secs(10))).await
    }
    .await;
    deployment.stop().await;

    let resp = result.context("sandbox check failed")?;
    println!("is_alive: {}", resp.is_alive);
    if !resp.message.is_empty() {
        println!("message: {}", resp.message);
    }
    anyhow::ensure!(resp.is_alive, "sandbox did not report alive");
    Ok(())
}

async fn verify_tool(deployment_config: DeploymentConfig, tool_id: &str) -> Result<()> {
    deployment_config.validate_credentials()?;
    let control_plane: Arc<dyn sandbox::ControlPlane> =
        Arc::new(HttpControlPlane::from_config(&deployment_config));
    let provisioner = TemplateProvisioner::new(control_plane, Arc::new(deployment_config));
    provisioner
        .verify(tool_id)
        .await
        .with_context(|| format!("sandbox tool {tool_id} is not usable"))?;
    println!("sandbox tool {tool_id} is ACTIVE");
    Ok(())
}
