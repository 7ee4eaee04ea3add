use std::net::SocketAddr;

use chrono::Duration;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use shuge::auth::TokenSigner;
use shuge::config::{Cli, Config};
use shuge::state::AppState;
use shuge::{db, routes, workers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli);
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {}", data_dir.display());

    let config = Config::load(&cli)?;

    // Ensure uploads directory exists
    std::fs::create_dir_all(config.uploads_path())?;

    // Initialize database
    let pool = db::create_pool(&config.db_path())?;
    db::run_migrations(&pool)?;

    let lifetime = Duration::hours(config.auth.token_hours);
    let tokens = match config.auth.token_secret.as_deref() {
        Some(secret) => TokenSigner::new(secret.as_bytes(), lifetime)?,
        None => {
            tracing::warn!("auth.token_secret is not set; tokens will not survive a restart");
            TokenSigner::ephemeral(lifetime)?
        }
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    // Build app state and background workers
    let (state, channels) = AppState::build(pool, config, tokens)?;
    let shutdown = CancellationToken::new();
    let handles = workers::spawn(&state, channels, shutdown.clone())?;

    let app = routes::router(state);

    // Start server
    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_ctrl_c(shutdown.clone()))
    .await?;

    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
    tracing::info!("Shut down cleanly");

    Ok(())
}

async fn wait_for_ctrl_c(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "could not listen for ctrl-c");
            }
            tracing::info!("Shutdown requested");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
