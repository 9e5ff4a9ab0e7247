//! Debug HTTP endpoint: runtime and dispatch counters for operators.

use crate::stats::DispatchStats;
use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone)]
pub struct DebugState {
    pub stats: Arc<DispatchStats>,
    /// Conversation task tracker; its length is the number of live conversation tasks.
    pub tracker: TaskTracker,
}

pub fn router(state: DebugState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/debug/info", get(info_http))
        .with_state(state)
}

/// Bind `bind:port` and serve until `cancel` fires.
pub async fn run_debug_server(
    bind: &str,
    port: u16,
    state: DebugState,
    cancel: CancellationToken,
) -> Result<()> {
    let bind_addr = format!("{}:{}", bind.trim(), port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("debug endpoint listening on {}", bind_addr);
    serve(listener, state, cancel).await
}

/// Serve on an already bound listener until `cancel` fires.
pub async fn serve(listener: TcpListener, state: DebugState, cancel: CancellationToken) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("debug server exited")?;
    log::info!("debug endpoint stopped");
    Ok(())
}

/// GET / returns a simple health JSON (for probes).
async fn health_http() -> Json<serde_json::Value> {
    Json(json!({ "runtime": "running" }))
}

/// GET /debug/info returns runtime and dispatch counters.
async fn info_http(State(state): State<DebugState>) -> Json<serde_json::Value> {
    let stats = &state.stats;
    Json(json!({
        "runtime": "running",
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "startedAt": stats.started_at().to_rfc3339(),
        "uptimeSecs": stats.uptime_secs(),
        "activeConversations": stats.active_conversations(),
        "trackedTasks": state.tracker.len(),
        "updatesReceived": stats.updates_received(),
        "enqueueFailures": stats.enqueue_failures(),
        "handlerFailures": stats.handler_failures(),
    }))
}
