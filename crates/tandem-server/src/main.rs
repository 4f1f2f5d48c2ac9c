mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tandem_core::{AppConfig, AppState, DbParticipantResolver, Hub};
use tandem_db::PgConnectOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat, LoggingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    init_tracing(&config.logging);
    if config.generated {
        tracing::info!("Generated default config at '{}'", args.config);
    }

    ensure_sqlite_dir(&config.database.url)?;
    let pool = tandem_db::create_pool_full(
        &config.database.url,
        config.database.max_connections,
        Some(PgConnectOptions {
            statement_timeout_secs: config.database.statement_timeout_secs,
        }),
    )
    .await
    .context("failed to connect to database")?;

    let resolver = Arc::new(DbParticipantResolver::new(pool));
    let hub = Hub::spawn(resolver, config.gateway.hub_config());

    let state = AppState {
        hub: hub.clone(),
        config: AppConfig {
            jwt_secret: config.auth.jwt_secret.clone(),
            gateway: config.gateway.session_config(),
        },
    };

    let app = tandem_ws::gateway_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;
    tracing::info!("Gateway listening on ws://{}/ws", listener.local_addr()?);

    // Upgraded sockets are not tracked by axum's graceful shutdown, so the hub
    // closes them before the listener stops.
    let shutdown_hub = hub.clone();
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down (ctrl-c)...");
        match shutdown_hub.stats().await {
            Ok(stats) => tracing::info!(
                users = stats.users,
                sessions = stats.sessions,
                evictions = stats.evictions,
                dropped_broadcasts = stats.dropped_broadcasts,
                delivered_frames = stats.delivered_frames,
                slow_resolutions = stats.slow_resolutions,
                "closing gateway sessions"
            ),
            Err(err) => tracing::warn!(error = %err, "hub stats unavailable"),
        }
        shutdown_hub.shutdown().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    match logging.format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Creates the parent directory of a file-backed SQLite database.
fn ensure_sqlite_dir(database_url: &str) -> Result<()> {
    let Some(rest) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}
