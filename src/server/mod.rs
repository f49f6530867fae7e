//! Read-only HTTP API over the rollup store.
//!
//! Serves the current snapshot and the day/week/month rollups. Windows
//! with no data come back as empty rollups; store failures become a
//! generic 503 without internal details.

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Settings;
use crate::rollup::RollupPipeline;
use crate::rollup_store::SqliteRollupStore;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: RollupPipeline,
}

impl AppState {
    pub async fn new(settings: &Settings) -> anyhow::Result<Self> {
        let store = Arc::new(SqliteRollupStore::new(&settings.database_path()).await?);
        let pipeline = RollupPipeline::new(
            store.clone(),
            store,
            Arc::new(settings.weighting.clone()),
        )
        .with_current_window(settings.current_window_hours);
        Ok(Self { pipeline })
    }
}

/// Start the web server.
pub async fn serve(settings: &Settings, host: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState::new(settings).await?;
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
