//! Automation flow endpoints.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::api::error::ApiError;
use crate::api::types::{now, parse_id, request_meta, ApiContext, ApiResponse};
use crate::automation::{ActiveFlowSummary, FlowDetail, FlowStats, StepOutcome, StepSubmission};
use crate::models::AutomationFlow;

/// Default `flowType` when the caller does not name one.
const DEFAULT_FLOW_TYPE: &str = "custom";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowRequest {
    pub appointment_id: String,
    #[serde(default)]
    pub flow_type: Option<String>,
    pub flow_config: Value,
    /// Accepted for compatibility; flows always start at step 0.
    #[serde(default)]
    pub current_step: Option<Value>,
    /// Accepted for compatibility; flows always start active.
    #[serde(default)]
    pub status: Option<Value>,
}

/// `POST /api/automation/flows`
pub async fn create(
    State(ctx): State<ApiContext>,
    Json(req): Json<CreateFlowRequest>,
) -> Result<Response, ApiError> {
    let appointment_id = parse_id(&req.appointment_id, "appointment")?;
    if req.current_step.is_some() || req.status.is_some() {
        tracing::debug!(appointment_id = %appointment_id, "Ignoring currentStep/status on flow creation");
    }
    let flow_type = req
        .flow_type
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_FLOW_TYPE);

    let conn = ctx.core.open_db()?;
    let flow = ctx
        .core
        .flow_engine(&conn)
        .create_flow(&appointment_id, flow_type, &req.flow_config, &now())?;
    Ok(ApiResponse::created(flow))
}

/// `GET /api/automation/flows/:id`
pub async fn detail(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<FlowDetail>>, ApiError> {
    let id = parse_id(&id, "flow")?;
    let conn = ctx.core.open_db()?;
    let detail = ctx.core.flow_engine(&conn).get_flow_detail(&id)?;
    Ok(ApiResponse::ok(detail))
}

/// `POST /api/automation/flows/:id/steps/:step_id/response`
pub async fn submit_step(
    State(ctx): State<ApiContext>,
    Path((id, step_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(submission): Json<StepSubmission>,
) -> Result<Json<ApiResponse<StepOutcome>>, ApiError> {
    let id = parse_id(&id, "flow")?;
    let step_index: usize = step_id
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request("INVALID_STEP", format!("Invalid step id: {step_id}")))?;

    let conn = ctx.core.open_db()?;
    let outcome = ctx.core.flow_engine(&conn).submit_step_response(
        &id,
        step_index,
        &submission,
        &request_meta(&headers),
        &now(),
    )?;
    Ok(ApiResponse::ok(outcome))
}

/// `PUT /api/automation/flows/:id/pause`
pub async fn pause(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AutomationFlow>>, ApiError> {
    let id = parse_id(&id, "flow")?;
    let conn = ctx.core.open_db()?;
    let flow = ctx.core.flow_engine(&conn).pause_flow(&id, &now())?;
    Ok(ApiResponse::ok(flow))
}

/// `PUT /api/automation/flows/:id/resume`
pub async fn resume(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AutomationFlow>>, ApiError> {
    let id = parse_id(&id, "flow")?;
    let conn = ctx.core.open_db()?;
    let flow = ctx.core.flow_engine(&conn).resume_flow(&id, &now())?;
    Ok(ApiResponse::ok(flow))
}

/// `DELETE /api/automation/flows/:id`: cancels; the row is kept.
pub async fn cancel(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AutomationFlow>>, ApiError> {
    let id = parse_id(&id, "flow")?;
    let conn = ctx.core.open_db()?;
    let flow = ctx.core.flow_engine(&conn).cancel_flow(&id, &now())?;
    Ok(ApiResponse::ok(flow))
}

/// `GET /api/automation/stats`
pub async fn stats(
    State(ctx): State<ApiContext>,
) -> Result<Json<ApiResponse<FlowStats>>, ApiError> {
    let conn = ctx.core.open_db()?;
    let stats = ctx.core.flow_engine(&conn).stats()?;
    Ok(ApiResponse::ok(stats))
}

/// `GET /api/automation/active-flows`
pub async fn active_flows(
    State(ctx): State<ApiContext>,
) -> Result<Json<ApiResponse<Vec<ActiveFlowSummary>>>, ApiError> {
    let conn = ctx.core.open_db()?;
    let flows = ctx.core.flow_engine(&conn).active_flows()?;
    Ok(ApiResponse::ok(flows))
}
