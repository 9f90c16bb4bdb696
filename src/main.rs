// src/main.rs

use std::process::ExitCode;

use clap::Parser;
use thiserror::Error;

use room_relay::{
    config::{Cli, Config, ConfigError},
    credentials::CredentialError,
    routes::build_router,
    state::AppState,
    telemetry::init_tracing,
};

#[derive(Error, Debug)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// The main entry point for our application.
#[tokio::main]
async fn main() -> ExitCode {
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };
    init_tracing(config.log_format);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(event = "server.exit", error = %e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    let addr = config.socket_addr()?;
    let state = AppState::from_config(config).await?;
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;
    tracing::info!(event = "server.listen", %addr, "listening on ws://{addr}/ws");

    let maintenance = state.spawn_maintenance();
    let shutdown_state = state.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!(event = "server.shutdown", "shutdown requested");
            shutdown_state.begin_shutdown();
        })
        .await
        .map_err(StartupError::Serve)?;

    // Sessions keep draining after the listener stops accepting.
    state.begin_shutdown();
    let remaining = state.drain(state.config.flush_deadline()).await;
    if remaining > 0 {
        tracing::warn!(event = "server.drain", remaining, "sessions still open at deadline");
    }
    let _ = maintenance.await;

    if let Err(e) = state.credentials.persist_if_dirty().await {
        tracing::error!(event = "credentials.persist", error = %e);
    }
    tracing::info!(event = "server.stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
