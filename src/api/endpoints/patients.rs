//! Patient endpoints.

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::{now, ApiContext, ApiResponse};
use crate::db;
use crate::messaging::normalize_phone;
use crate::models::Patient;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePatientRequest {
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// `POST /api/patients`: register a patient under a normalized phone.
pub async fn create(
    State(ctx): State<ApiContext>,
    Json(req): Json<CreatePatientRequest>,
) -> Result<Response, ApiError> {
    let first_name = req.first_name.trim();
    if first_name.is_empty() {
        return Err(ApiError::validation("firstName is required"));
    }
    let phone = normalize_phone(&req.phone, &ctx.core.config().default_country_code)
        .ok_or_else(|| ApiError::validation(format!("Invalid phone number: {}", req.phone)))?;

    let patient = Patient {
        id: Uuid::new_v4(),
        first_name: first_name.to_string(),
        last_name: req.last_name.trim().to_string(),
        phone,
        email: req.email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty()),
        created_at: now(),
    };
    let conn = ctx.core.open_db()?;
    db::insert_patient(&conn, &patient)?;

    tracing::info!(patient_id = %patient.id, "Patient registered");
    Ok(ApiResponse::created(patient))
}
