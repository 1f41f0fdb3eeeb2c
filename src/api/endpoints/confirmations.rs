//! Confirmation scheduler trigger.

use axum::extract::State;
use axum::Json;

use crate::api::error::ApiError;
use crate::api::types::{now, ApiContext, ApiResponse};
use crate::confirmation::{run_confirmation_pass, ConfirmationRunSummary};

/// `POST /api/confirmations/run`: one scheduler pass, on demand.
pub async fn run(
    State(ctx): State<ApiContext>,
) -> Result<Json<ApiResponse<ConfirmationRunSummary>>, ApiError> {
    let summary = run_confirmation_pass(&ctx.core, now()).await?;
    Ok(ApiResponse::ok(summary))
}
