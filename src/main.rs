use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use graft::config::AppConfig;
use graft::server::{create_router, AppState};
use graft::shutdown::wait_for_shutdown;
use graft::workflow::{run_phase, Phase, WorkflowContext};

#[derive(Parser)]
#[command(name = "graft", about = "Automated development workflow orchestrator")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook server
    Serve,
    /// Run one phase of one workflow, then exit
    Phase {
        #[arg(value_enum)]
        phase: Phase,
        /// GitHub issue number the workflow belongs to
        #[arg(long)]
        issue: u64,
        /// Existing workflow id; plan mints one when omitted
        #[arg(long)]
        workflow_id: Option<String>,
        /// Dispatch the next phase on success
        #[arg(long)]
        chain: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(config, cli.config).await,
        Command::Phase {
            phase,
            issue,
            workflow_id,
            chain,
        } => {
            let ctx = WorkflowContext::new(config, cli.config)?;
            if let Err(e) = run_phase(&ctx, phase, issue, workflow_id, chain).await {
                tracing::error!(%phase, issue, error = %e, "Phase failed");
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn serve(config: AppConfig, config_path: Option<String>) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        repo = %config.repo_full_name(),
        "Starting graft server"
    );

    let state = Arc::new(AppState::new(config.clone(), config_path)?);
    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.server.host, config.server.port
    ))
    .await?;

    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    Ok(())
}
