// Charmvault Server - Main Entry Point
//
// Bootstrap only: CLI parsing, logging setup, and the serve /
// export-search commands. Handlers and wiring live in the library
// modules.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use charmvault_core::Config;
use charmvault_server::{build_state, router};

#[derive(Parser, Debug)]
#[command(author, version, about = "Charmvault artifact repository server", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, value_name = "FILE", env = "CHARMVAULT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server
    Serve,
    /// Export all entity metadata to the search index, then exit
    ExportSearch,
}

fn main() -> ExitCode {
    init_tracing();

    // Usage errors exit with status 2 via clap itself; anything that
    // fails beyond this point is a configuration or runtime error.
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("charmvault-server: {err:#}");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::read(&cli.config)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config).await,
        Command::ExportSearch => run_export_search(config).await,
    }
}

async fn run_serve(config: Config) -> anyhow::Result<()> {
    info!(
        mongo_url = %config.mongo_url,
        api_addr = %config.api_addr,
        blob_store = %config.blob_store.provider,
        search = config.elasticsearch_addr.is_some(),
        "starting server"
    );

    let state = build_state(&config).await?;
    let app = router::build_router(state);

    let listener = TcpListener::bind(listen_addr(&config.api_addr))
        .await
        .context("failed to bind socket")?;
    let actual_addr = listener
        .local_addr()
        .context("failed to read local address")?;
    info!("listening on {actual_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated with error")?;

    Ok(())
}

async fn run_export_search(config: Config) -> anyhow::Result<()> {
    if config.elasticsearch_addr.is_none() {
        anyhow::bail!("no elasticsearch-addr configured; nothing to export to");
    }

    let state = build_state(&config).await?;
    let exported = state
        .store
        .export_to_search_index(state.search.as_ref())
        .await?;
    println!("exported {exported} entities to the search index");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

/// Accepts the `:8080` shorthand some deployments use for api-addr.
fn listen_addr(api_addr: &str) -> String {
    if api_addr.starts_with(':') {
        format!("0.0.0.0{api_addr}")
    } else {
        api_addr.to_owned()
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_addresses_bind_all_interfaces() {
        assert_eq!(listen_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(listen_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }
}
