mod config;
mod http;
mod state;
mod trace;
mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kv_core::watch::WatchRegistry;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Args, ServerConfig};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load(args.config.as_deref()).context("loading server config")?;

    let _log_guards = trace::init_logging("./logs", &config.log_level)
        .await
        .context("initializing logging")?;

    if config.objectstore_backend != config::ObjectStoreBackend::Postgres {
        anyhow::bail!("OBJECTSTORE_BACKEND=s3 is not implemented; the PostgreSQL backend is authoritative");
    }

    log::info!("connecting to {}:{}/{}", config.db_host, config.db_port, config.db_name);
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url())
        .await
        .context("connecting to database")?;

    sqlx::migrate!("../kv-core/migrations")
        .run(&pool)
        .await
        .context("running migrations")?;

    let watch = WatchRegistry::new();
    let config = Arc::new(config);
    let authz = http::authz::default_layer();
    let state = AppState::new(pool.clone(), watch.clone(), config.clone(), authz);

    tokio::spawn({
        let pool = pool.clone();
        let watch = watch.clone();
        async move {
            if let Err(e) = kv_core::watch::run_listener(pool, watch).await {
                log::error!("watch listener task exited: {e}");
            }
        }
    });

    tokio::spawn({
        let pool = pool.clone();
        let interval = config.cleanup_interval();
        async move {
            kv_core::sweeper::run(pool, interval).await;
        }
    });

    let app = axum::Router::new()
        .merge(http::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    log::info!("kv-server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("server loop exited")?;
    Ok(())
}
