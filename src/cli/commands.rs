//! CLI command definitions for agent-harbor.
//!
//! Two long-running commands: `serve` starts the submission API together
//! with the execution worker pool, and `proxy` starts the standalone
//! inference proxy sandboxes talk to.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::api::{self, AppState};
use crate::catalog::CatalogClient;
use crate::execution::{DockerClient, ExecutionLimits};
use crate::proxy::{self, ProxyState};
use crate::registry::RunRegistry;
use crate::runner::{spawn_workers, RunnerConfig, SandboxRunner, WorkQueue};

/// Default upstream catalog for agent artifacts.
const DEFAULT_CATALOG_URL: &str = "https://platform.ridges.ai";

/// Default on-disk cache for downloaded agent artifacts.
const DEFAULT_CACHE_DIR: &str = "./agent_cache";

/// Sandboxed agent run execution service.
#[derive(Parser)]
#[command(name = "agent-harbor")]
#[command(about = "Execute catalog agents against problem statements in sandboxed containers")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the run submission API and execution workers.
    Serve(ServeArgs),

    /// Start the inference proxy.
    Proxy(ProxyArgs),
}

/// Arguments for `agent-harbor serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Port for the submission API.
    #[arg(short, long, default_value = "8888", env = "HARBOR_PORT")]
    pub port: u16,

    /// Docker image for sandbox containers.
    #[arg(long, default_value = "python:3.11-slim", env = "HARBOR_IMAGE")]
    pub image: String,

    /// Wall-clock execution timeout per run, in seconds.
    #[arg(long, default_value = "300", env = "HARBOR_TIMEOUT_SECONDS")]
    pub timeout_seconds: u64,

    /// Memory ceiling per sandbox, in MB.
    #[arg(long, default_value = "2048")]
    pub memory_mb: u64,

    /// CPU core ceiling per sandbox.
    #[arg(long, default_value = "2.0")]
    pub cpu: f64,

    /// Docker network for sandbox containers.
    #[arg(long, default_value = "bridge", env = "HARBOR_NETWORK")]
    pub network: String,

    /// Number of concurrent execution workers.
    #[arg(long, default_value = "4", env = "HARBOR_WORKERS")]
    pub workers: usize,

    /// Capacity of the pending execution queue.
    #[arg(long, default_value = "64", env = "HARBOR_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Host-side proxy base URL for credential registration. Empty disables
    /// registration.
    #[arg(long, default_value = "http://localhost:8001", env = "HARBOR_PROXY_REGISTER_URL")]
    pub proxy_register_url: String,

    /// Proxy base URL as reachable from inside sandbox containers.
    #[arg(long, default_value = "http://proxy:8001", env = "HARBOR_PROXY_INTERNAL_URL")]
    pub proxy_internal_url: String,

    /// Upstream agent catalog base URL.
    #[arg(long, default_value = DEFAULT_CATALOG_URL, env = "HARBOR_CATALOG_URL")]
    pub catalog_url: String,

    /// Directory for cached agent artifacts.
    #[arg(long, default_value = DEFAULT_CACHE_DIR, env = "HARBOR_CACHE_DIR")]
    pub cache_dir: String,
}

/// Arguments for `agent-harbor proxy`.
#[derive(Parser, Debug)]
pub struct ProxyArgs {
    /// Port for the proxy.
    #[arg(short, long, default_value = "8001", env = "PROXY_PORT")]
    pub port: u16,

    /// Default upstream inference endpoint when a run has no registered
    /// credentials.
    #[arg(long, env = "INFERENCE_URL")]
    pub inference_url: Option<String>,

    /// Default upstream API key when a run has no registered credentials.
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,
}

/// Parse CLI arguments without running a command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Proxy(args) => run_proxy_command(args).await,
    }
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let limits = ExecutionLimits {
        memory_mb: args.memory_mb,
        cpu_cores: args.cpu,
        ..Default::default()
    };
    let register_url = if args.proxy_register_url.is_empty() {
        None
    } else {
        Some(args.proxy_register_url.clone())
    };
    let config = RunnerConfig::new()
        .with_image(&args.image)
        .with_timeout(Duration::from_secs(args.timeout_seconds))
        .with_limits(limits)
        .with_network(&args.network)
        .with_proxy_register_url(register_url)
        .with_proxy_internal_url(&args.proxy_internal_url);

    let docker = DockerClient::new()?;
    let runner = Arc::new(SandboxRunner::new(docker, config));
    let registry = RunRegistry::new();
    let catalog = Arc::new(CatalogClient::new(&args.catalog_url, &args.cache_dir)?);

    let (queue, receiver) = WorkQueue::bounded(args.queue_capacity);
    spawn_workers(receiver, args.workers, registry.clone(), Arc::clone(&runner));

    let state = AppState {
        registry,
        catalog,
        runner: Arc::clone(&runner),
        queue,
    };
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        workers = args.workers,
        image = %args.image,
        "Submission API listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, stopping active sandboxes");
    runner.cleanup_all().await;
    Ok(())
}

async fn run_proxy_command(args: ProxyArgs) -> anyhow::Result<()> {
    let state = ProxyState::new(args.inference_url, args.api_key);
    let app = proxy::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Inference proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown signal handler");
    }
}
