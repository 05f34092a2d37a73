//! Optional read-only stats endpoint.
//!
//! A single `GET /api/stats` JSON snapshot of the per-device and global
//! counters. Enabled only when a listen address is configured.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, routing::get, Json, Router};
use log::{info, warn};
use tokio::sync::watch;

use crate::miner::stats::{DeviceState, ShareCounters};
use crate::source::{SourceMode, WorkSource};
use crate::submit::SoloTotals;

/// Read-only view shared by the endpoint, the periodic status task and
/// the stats-file writer.
pub struct StatsContext {
    pub devices: Vec<Arc<DeviceState>>,
    pub counters: Arc<ShareCounters>,
    pub totals: Arc<SoloTotals>,
    pub source: Arc<dyn WorkSource>,
    pub started: Instant,
}

impl StatsContext {
    pub fn payload(&self) -> serde_json::Value {
        let shares = self
            .source
            .pool_counters()
            .unwrap_or_else(|| self.counters.snapshot());
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": match self.source.mode() {
                SourceMode::Pool => "pool",
                SourceMode::Solo => "solo",
            },
            "uptime_sec": self.started.elapsed().as_secs(),
            "shares": {
                "accepted": shares.valid,
                "stale": shares.stale,
                "rejected": shares.invalid,
                "total": shares.total(),
            },
            "blocks_found": self.totals.blocks(),
            "transactions": self.totals.transactions(),
            "devices": self.devices.iter().map(|d| d.snapshot().to_json()).collect::<Vec<_>>(),
        })
    }
}

async fn stats(State(ctx): State<Arc<StatsContext>>) -> Json<serde_json::Value> {
    Json(ctx.payload())
}

pub async fn serve(ctx: Arc<StatsContext>, listen: String, mut shutdown: watch::Receiver<bool>) {
    let app = Router::new()
        .route("/api/stats", get(stats))
        .with_state(ctx);

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            warn!("stats endpoint bind {} failed: {}", listen, e);
            return;
        }
    };
    info!("stats endpoint on http://{}/api/stats", listen);

    let wait_shutdown = async move {
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(wait_shutdown)
        .await
    {
        warn!("stats endpoint error: {}", e);
    }
}
