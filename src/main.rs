//! sandbox-sessions - sandbox session manager with HTTP API and streamed execution.
//!
//! Usage:
//!   sandbox-sessions serve [--port 8080] [--provider local|remote]

use clap::{Parser, Subcommand};
use sandbox_sessions::config::{
    ProviderKind, ServerConfig, DEFAULT_PORT, DEFAULT_SHUTDOWN_DEADLINE, DEFAULT_SWEEP_INTERVAL,
    DEFAULT_TEMPLATE,
};
use sandbox_sessions::pipeline::DEFAULT_AGENT_COMMAND;
use sandbox_sessions::registry::{DEFAULT_CREATE_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use sandbox_sessions::{http_server, reaper, AppState};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "sandbox-sessions")]
#[command(about = "Sandbox session manager with HTTP API", version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "SANDBOX_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "SANDBOX_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Sandbox backend
    #[arg(long, env = "SANDBOX_PROVIDER", value_enum, default_value_t = ProviderKind::Local)]
    provider: ProviderKind,

    /// Base URL of the remote sandbox service
    #[arg(long, env = "SANDBOX_PROVIDER_URL")]
    provider_url: Option<String>,

    /// API key for the remote sandbox service
    #[arg(long, env = "SANDBOX_PROVIDER_API_KEY", hide_env_values = true)]
    provider_api_key: Option<String>,

    /// Directory holding local sandboxes
    #[arg(long, env = "SANDBOX_LOCAL_ROOT")]
    local_root: Option<PathBuf>,

    /// Template used when a create request names none
    #[arg(long, env = "SANDBOX_TEMPLATE", default_value = DEFAULT_TEMPLATE)]
    template: String,

    /// API key injected into every sandbox for the agent
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    agent_api_key: Option<String>,

    /// Base URL override for agent traffic inside the sandbox
    #[arg(long, env = "AGENT_BASE_URL")]
    agent_base_url: Option<String>,

    /// Agent invocation; the quoted prompt is appended
    #[arg(long, env = "AGENT_COMMAND", default_value = DEFAULT_AGENT_COMMAND)]
    agent_command: String,

    /// Seconds of inactivity before a session is reaped
    #[arg(long, env = "SANDBOX_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    idle_timeout_secs: u64,

    /// Sandbox lifetime requested from the provider at creation
    #[arg(long, env = "SANDBOX_CREATE_TIMEOUT_SECS", default_value_t = DEFAULT_CREATE_TIMEOUT.as_secs())]
    create_timeout_secs: u64,

    /// Background sweep interval; 0 disables it
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL.as_secs())]
    sweep_interval_secs: u64,

    /// How long shutdown waits for sandbox kills and open connections
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_DEADLINE.as_secs())]
    shutdown_deadline_secs: u64,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            provider: args.provider,
            provider_url: args.provider_url,
            provider_api_key: args.provider_api_key,
            local_root: args.local_root,
            template: args.template,
            agent_api_key: args.agent_api_key,
            agent_base_url: args.agent_base_url,
            agent_command: args.agent_command,
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            create_timeout: Duration::from_secs(args.create_timeout_secs),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            shutdown_deadline: Duration::from_secs(args.shutdown_deadline_secs),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Serve(serve) => serve_until_shutdown(serve.into()).await,
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "sandbox-sessions failed");
        std::process::exit(1);
    }
}

async fn serve_until_shutdown(
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let provider = config.build_provider()?;
    let sweep_interval = config.sweep_interval;
    tracing::info!(
        provider = provider.name(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Configured session manager"
    );

    let state = AppState::new(provider, config);
    let sweeper = (!sweep_interval.is_zero())
        .then(|| reaper::spawn_sweeper(state.registry.clone(), sweep_interval));

    // Drains the registry itself once the signal arrives.
    let served = http_server::run_server(state, shutdown_signal()).await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    served?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
