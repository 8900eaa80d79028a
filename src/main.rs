// src/main.rs
use std::net::SocketAddr;
use std::process::ExitCode;

use axum_server::Handle;
use dotenvy::dotenv;
use tokio::signal::{self, ctrl_c};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use swiftpoll::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok(); // Load environment variables from .env file

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("swiftpoll=info,tower_http=info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let address: SocketAddr = match config.address().parse() {
        Ok(address) => address,
        Err(e) => {
            error!("Invalid listen address {}: {e}", config.address());
            return ExitCode::FAILURE;
        }
    };

    let service = match swiftpoll::build_service(&config).await {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to connect to the database: {e}");
            return ExitCode::FAILURE;
        }
    };

    let app = swiftpoll::build_app(service, &config);

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone(), config.shutdown_grace));

    info!("Server running on http://{address}");
    if let Err(e) = axum_server::bind(address)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
    {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Server shut down");
    ExitCode::SUCCESS
}

async fn shutdown_signal(handle: Handle, grace: std::time::Duration) {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
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

    handle.graceful_shutdown(Some(grace));
}
