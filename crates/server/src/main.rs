mod bootstrap;
mod chat;
mod health;
mod sweeper;
#[cfg(test)]
mod test_support;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use kcart_core::config::{AppConfig, LoadOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bootstrap::Application;

fn init_logging(config: &AppConfig) {
    use kcart_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

fn router(app: &Application) -> Router {
    chat::router(Arc::clone(&app.runtime))
        .merge(health::router(Arc::clone(&app.runtime), Arc::clone(&app.flash_sales)))
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap(config)?;
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    let shutdown = CancellationToken::new();
    let sweeper = sweeper::spawn(
        Arc::clone(&app.runtime),
        Duration::from_secs(app.config.session.sweep_interval_secs),
        app.config.session_max_idle(),
        shutdown.clone(),
    );

    let service = router(&app).into_make_service_with_connect_info::<SocketAddr>();
    let mut server = tokio::spawn(
        axum::serve(listener, service)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );
    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        tools = ?app.runtime.tool_names(),
        "kcart-server listening"
    );

    tokio::select! {
        result = &mut server => {
            shutdown.cancel();
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }

    info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        active_sessions = app.runtime.sessions().len(),
        "kcart-server stopping; in-memory sessions will be lost"
    );
    shutdown.cancel();

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined??,
        Err(_) => warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "open connections did not drain in time"
        ),
    }
    if let Err(error) = sweeper.await {
        warn!(event_name = "system.sweeper.join_failed", correlation_id = "shutdown", error = %error, "sweeper task failed");
    }

    Ok(())
}
