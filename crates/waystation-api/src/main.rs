//! Waystation CLI and HTTP entry point.
//!
//! Binary name: `wstn`
//!
//! Parses CLI arguments, initializes tracing and the engine, then either
//! serves the trigger endpoint or runs a ledger inspection command.

mod cli;
mod demo;
mod http;
mod inspect;
mod state;

use anyhow::Context;
use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;

use waystation_infra::sqlite::pool::default_data_dir;
use waystation_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "wstn", &mut std::io::stdout());
        return Ok(());
    }

    let (log_json, otel) = match &cli.command {
        Commands::Serve { log_json, otel, .. } => (*log_json, *otel),
        _ => (false, false),
    };
    init_tracing(
        &TracingOptions::for_verbosity(cli.verbose, cli.quiet)
            .json(log_json)
            .otel(otel),
    )
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let state = AppState::init(data_dir).await?;

    let result = match cli.command {
        Commands::Serve { port, host, .. } => serve(state.clone(), &host, port, cli.quiet).await,
        Commands::Run { command } => cli::run::handle_run_command(command, &state, cli.json).await,
        Commands::Workflows => cli::run::list_workflows(&state, cli.json),
        Commands::Completions { .. } => Ok(()),
    };

    state.db_pool.close().await;
    shutdown_tracing();
    result
}

async fn serve(state: AppState, host: &str, port: u16, quiet: bool) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    let sweeper = state.sweeper.clone().spawn(shutdown.clone());

    if !quiet {
        println!(
            "  {} Waystation listening on {}",
            console::style("*").bold(),
            console::style(format!("http://{addr}")).cyan()
        );
        println!(
            "  {}",
            console::style(format!("continuations go to {}", state.config.base_url)).dim()
        );
        println!(
            "  {}",
            console::style(format!("ledger in {}", state.data_dir.display())).dim()
        );
        println!("  {}", console::style("Press Ctrl+C to stop").dim());
    }
    tracing::info!(
        %addr,
        base_url = %state.config.base_url,
        data_dir = %state.data_dir.display(),
        "server started"
    );

    let router = http::router::build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "timer sweeper task ended abnormally");
    }

    if !quiet {
        println!("\n  Server stopped.");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
