//! Web server: axum REST API over the live signal store.
//!
//! Shared state holds the ingestion pipeline (store + notification bus),
//! the company table, an optional SQLite archive, and the flush watermark.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use beacon_core::{CompanyTable, Pipeline};

use crate::db::{ArchiveError, SignalArchive};

pub mod ingest;
pub mod routes;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub pipeline: Pipeline,
    pub companies: CompanyTable,
    pub archive: Option<Arc<dyn SignalArchive>>,
    pub auth_token: Option<String>,
    /// Default window for windowed readings.
    pub sample_size: usize,
    /// Highest sequence id already written to the archive (0 = none).
    flushed_through: Mutex<u64>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FlushOutcome {
    pub saved: usize,
    pub flushed_through: u64,
}

impl AppState {
    pub fn new(
        pipeline: Pipeline,
        companies: CompanyTable,
        archive: Option<Arc<dyn SignalArchive>>,
        auth_token: Option<String>,
        sample_size: usize,
    ) -> Self {
        AppState {
            pipeline,
            companies,
            archive,
            auth_token,
            sample_size,
            flushed_through: Mutex::new(0),
        }
    }

    pub async fn flushed_through(&self) -> u64 {
        *self.flushed_through.lock().await
    }

    /// Write observations newer than the watermark to the archive.
    ///
    /// Rows are snapshotted under the store's read lock, which is released
    /// before the archive write so ingestion is never held up by SQLite.
    pub async fn flush(&self) -> Result<FlushOutcome, ArchiveError> {
        let mut watermark = self.flushed_through.lock().await;
        let Some(archive) = &self.archive else {
            return Ok(FlushOutcome {
                saved: 0,
                flushed_through: *watermark,
            });
        };

        let records = {
            let store = self.pipeline.read();
            store.export_records(Some(*watermark))
        };
        let Some(last) = records.last().map(|r| r.sequence_id) else {
            return Ok(FlushOutcome {
                saved: 0,
                flushed_through: *watermark,
            });
        };

        let saved = archive.save(records).await?;
        *watermark = last;
        info!(saved, through = last, "flushed observations to archive");
        Ok(FlushOutcome {
            saved,
            flushed_through: last,
        })
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/cells", get(routes::api_cells))
        .route("/api/cells/:x/:y/:z", get(routes::api_cell_detail))
        .route("/api/devices", get(routes::api_devices))
        .route("/api/devices/:id", get(routes::api_device_detail))
        .route(
            "/api/filter",
            get(routes::api_filter_get).put(routes::api_filter_set),
        )
        .route("/api/export", get(routes::api_export))
        .route("/api/export/flush", post(routes::api_export_flush))
        .route("/api/stats", get(routes::api_stats))
        .route("/api/events", get(routes::api_events))
        // Ingest API (scanning bridges)
        .route(
            "/api/v1/advertisements",
            post(ingest::api_ingest_advertisements),
        )
        .with_state(state)
        .layer(cors)
}

/// Start the web server. Ctrl-C flushes to the archive, then exits.
pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> std::io::Result<()> {
    let app = build_router(state.clone());
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("beacon server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    match state.flush().await {
        Ok(outcome) => info!(saved = outcome.saved, "final flush complete"),
        Err(e) => warn!("final flush failed: {e}"),
    }
    if let Some(archive) = &state.archive {
        if let Err(e) = archive.close().await {
            warn!("closing archive session failed: {e}");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
