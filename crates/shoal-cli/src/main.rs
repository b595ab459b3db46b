mod serve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use shoal_core::{Services, ShoalConfig, ShoalError};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "shoal",
    about = "Shared-context server for multi-agent collaboration"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the tool surface over newline-delimited JSON-RPC on stdio.
    Serve,
    /// Validate the environment configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let filter = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            exit_code_for(&e)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let config = ShoalConfig::load()?;
            let services = Services::init(config).await?;
            tracing::info!(tools = services.registry().names().len(), "shoal ready");
            serve::run(services).await
        }
        Command::CheckConfig => {
            let config = ShoalConfig::load()?;
            println!("configuration ok");
            println!("  database_url: {}", config.database_url);
            println!("  token_ttl_seconds: {}", config.token_ttl_seconds);
            println!("  pool_size: {}", config.pool_size());
            println!(
                "  broadcast_bridge: {}",
                config.bridge_url().as_deref().unwrap_or("disabled")
            );
            println!("  performance_monitoring: {}", config.performance_monitoring);
            Ok(())
        }
    }
}

/// 0 clean shutdown, 2 configuration error, 3 schema mismatch, 1 anything
/// else.
fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    match e.downcast_ref::<ShoalError>() {
        Some(ShoalError::Config(_)) => ExitCode::from(2),
        Some(ShoalError::SchemaMismatch { .. }) => ExitCode::from(3),
        _ => ExitCode::from(1),
    }
}
