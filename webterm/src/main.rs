use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_shutdown::{Shutdown, with_grace};
use tracing::{error, info, warn};
use webterm::cli::Cli;
use webterm::config::Config;
use webterm::log::init_tracing;
use webterm::server::{self, AppState};
use webterm_bridge::{Bridge, SessionRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.level(), cli.trace_format);

    let config = Config::resolve(&cli)
        .into_diagnostic()
        .wrap_err("Invalid configuration")?;

    let shutdown = Shutdown::new();
    shutdown
        .install_signals()
        .into_diagnostic()
        .wrap_err("Failed to install signal handlers")?;

    let registry = Arc::new(SessionRegistry::new());
    let bridge = Bridge::new(
        Arc::clone(&registry),
        config.bridge.clone(),
        shutdown.cancellation_token(),
    );

    let listener = TcpListener::bind(config.listen)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to listen on {}", config.listen))?;
    let addr = listener.local_addr().into_diagnostic()?;
    info!(
        %addr,
        shell = %config.bridge.spawn.program.display(),
        "Terminal server listening on ws://{addr}/ws"
    );

    let state = AppState::new(bridge, config.gateway.clone());
    let mut server = tokio::spawn(server::serve(listener, state, shutdown.cancellation_token()));

    tokio::select! {
        _ = shutdown.wait_for_shutdown() => {}
        result = &mut server => {
            match result {
                Ok(Ok(())) => warn!("Server stopped unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "Server failed"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
            shutdown.shutdown();
        }
    }

    info!(sessions = registry.len(), "Shutting down");
    match registry.shutdown(config.shutdown_grace).await {
        Ok(count) => info!(sessions = count, "All shells terminated"),
        Err(e) => warn!(error = %e, "Exiting with shells still terminating"),
    }

    if !server.is_finished() && with_grace(config.shutdown_grace, &mut server).await.is_err() {
        warn!("Timed out waiting for open connections to close");
        server.abort();
    }

    if shutdown.last_signal().is_some() {
        shutdown.exit_process();
    }
    Ok(())
}
