// src/main.rs
use std::{error::Error, net::SocketAddr, process::ExitCode, sync::Arc, time::Duration};

use axum_server::Handle;
use dotenvy::dotenv;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use live_poll::{
    config::Config, db, identity::HeaderIdentity, routes, store::PgStore, AppState,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok(); // Load environment variables from .env file

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env()?;

    info!("Connecting to the database...");
    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;

    let store = PgStore::new(pool).await?;
    let identity = HeaderIdentity::new(config.identity_header.clone());
    let state = AppState::new(Arc::new(store), Arc::new(identity));

    let app = routes::create_app(
        state,
        config.cors_allowed_origin.as_deref(),
        &config.identity_header,
    );

    let address = SocketAddr::new(config.bind_address, config.port);
    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    info!("Server running on {address}");
    axum_server::bind(address)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
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

    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
