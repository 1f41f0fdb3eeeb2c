//! Health check endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::types::{ApiContext, ApiResponse};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: bool,
    pub ai_enabled: bool,
}

/// `GET /api/health`: liveness and database reachability.
pub async fn check(State(ctx): State<ApiContext>) -> Json<ApiResponse<HealthResponse>> {
    let database = match ctx.core.open_db() {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not open database");
            false
        }
    };

    ApiResponse::ok(HealthResponse {
        status: if database { "ok" } else { "degraded" },
        version: crate::config::APP_VERSION,
        database,
        ai_enabled: ctx.core.config().ai.enabled,
    })
}
