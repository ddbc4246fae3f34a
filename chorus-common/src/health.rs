//! Health check endpoint shared by the worker binaries

use axum::{routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status (e.g., "ok")
    pub status: String,
    /// Module name (e.g., "chorus-ad")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
}

/// Build a router serving `GET /health` for one worker binary
pub fn health_router(module: &'static str, version: &'static str) -> Router {
    let startup_time: DateTime<Utc> = crate::time::now();

    Router::new().route(
        "/health",
        get(move || async move {
            let uptime = crate::time::now().signed_duration_since(startup_time);
            Json(HealthResponse {
                status: "ok".to_string(),
                module: module.to_string(),
                version: version.to_string(),
                uptime_seconds: uptime.num_seconds().max(0) as u64,
            })
        }),
    )
}
