use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::control::{Controller, ScheduleRequest};

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(controller: Controller) -> Router {
    Router::new()
        .route("/get_data", get(get_data))
        .route("/get_history", get(get_history))
        .route("/pump/{action}", get(pump))
        .route("/set_jadwal", post(set_jadwal))
        .route("/get_jadwal", get(get_jadwal))
        .route("/api/status", get(api_status))
        .with_state(controller)
}

async fn get_data(State(c): State<Controller>) -> impl IntoResponse {
    Json(c.current().await)
}

async fn get_history(State(c): State<Controller>) -> impl IntoResponse {
    Json(c.history().await)
}

async fn pump(State(c): State<Controller>, Path(action): Path<String>) -> impl IntoResponse {
    Json(c.set_pump(&action).await)
}

/// The body is parsed by hand so that a non-JSON or wrongly-typed body gets
/// the same `{"status":"error"}` answer as a missing time.
async fn set_jadwal(State(c): State<Controller>, body: Bytes) -> impl IntoResponse {
    let req: ScheduleRequest = serde_json::from_slice(&body).unwrap_or_default();
    Json(c.set_schedule(req).await)
}

async fn get_jadwal(State(c): State<Controller>) -> impl IntoResponse {
    Json(c.schedule().await)
}

async fn api_status(State(c): State<Controller>) -> impl IntoResponse {
    Json(c.status().await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<F>(controller: Controller, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "api listening");

    axum::serve(listener, router(controller))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
