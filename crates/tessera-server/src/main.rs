//! Tessera server binary.
//!
//! Starts an axum HTTP server where every API request runs in its own database
//! unit of work, with structured logging, a background purge task and graceful
//! shutdown on SIGTERM/SIGINT that drains open sessions before exiting.

use std::net::SocketAddr;
use tessera_db::PoolHandle;
use tessera_server::{app, background, config, notes};
use tessera_session::{SessionFactory, SessionManager};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("TESSERA_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration: the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = PoolHandle::open(&config.database.path, config.database.pool_options())
        .expect("failed to open database pool: check database.path in config");

    {
        let conn = pool
            .acquire()
            .expect("failed to get database connection for schema setup");
        notes::ensure_schema(&conn).expect("failed to create database schema");
    }

    let sessions = SessionManager::new(SessionFactory::new(
        pool.clone(),
        config.database.session_options(),
    ));

    let purge = tokio::spawn(background::start_purge_task(
        sessions.clone(),
        config.maintenance.purge_interval_seconds,
        config.maintenance.retention_days,
    ));

    // Build application
    let app = app(sessions);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting tessera server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address: is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    purge.abort();

    // Wait for in-flight units of work to return their connections.
    match tokio::task::spawn_blocking(move || pool.close()).await {
        Ok(Ok(())) => tracing::info!("tessera server shut down"),
        Ok(Err(e)) => {
            tracing::error!(open_sessions = e.open_sessions, "shut down with sessions still open");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "pool shutdown task failed");
            std::process::exit(1);
        }
    }
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
