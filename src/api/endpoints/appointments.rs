//! Appointment endpoints.
//!
//! - `POST /api/appointments`: create
//! - `GET /api/appointments/:id`: read with patient
//! - `PUT /api/appointments/:id/status`: direct status write (last writer wins)
//! - `POST /api/appointments/:id/confirmation`: send a confirmation now

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::{now, parse_id, ApiContext, ApiResponse};
use crate::confirmation::send_confirmation;
use crate::db;
use crate::models::enums::AppointmentStatus;
use crate::models::{Appointment, AppointmentConfirmation, Patient};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAppointmentRequest {
    pub patient_id: String,
    /// `YYYY-MM-DDTHH:MM[:SS]` or `YYYY-MM-DD HH:MM[:SS]`, clinic local time.
    pub scheduled_at: String,
    pub treatment: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentDetail {
    pub appointment: Appointment,
    pub patient: Option<Patient>,
    pub confirmations: Vec<AppointmentConfirmation>,
}

fn parse_scheduled_at(raw: &str) -> Result<NaiveDateTime, ApiError> {
    let raw = raw.trim();
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .ok_or_else(|| ApiError::validation(format!("Invalid scheduledAt: {raw}")))
}

fn parse_status(raw: &str) -> Result<AppointmentStatus, ApiError> {
    AppointmentStatus::parse_loose(raw)
        .map_err(|_| ApiError::validation(format!("Unknown appointment status: {raw}")))
}

fn appointment_not_found(id: &Uuid) -> ApiError {
    ApiError::not_found("APPOINTMENT_NOT_FOUND", format!("Appointment not found: {id}"))
}

/// `POST /api/appointments`
pub async fn create(
    State(ctx): State<ApiContext>,
    Json(req): Json<CreateAppointmentRequest>,
) -> Result<Response, ApiError> {
    let patient_id = parse_id(&req.patient_id, "patient")?;
    let scheduled_at = parse_scheduled_at(&req.scheduled_at)?;
    let treatment = req.treatment.trim();
    if treatment.is_empty() {
        return Err(ApiError::validation("treatment is required"));
    }
    let status = match req.status.as_deref() {
        Some(raw) => parse_status(raw)?,
        None => AppointmentStatus::Planned,
    };

    let conn = ctx.core.open_db()?;
    if db::get_patient(&conn, &patient_id)?.is_none() {
        return Err(ApiError::not_found(
            "PATIENT_NOT_FOUND",
            format!("Patient not found: {patient_id}"),
        ));
    }
    let created_at = now();
    let appointment = Appointment {
        id: Uuid::new_v4(),
        patient_id,
        scheduled_at,
        treatment: treatment.to_string(),
        status,
        notes: req.notes,
        created_at,
        updated_at: created_at,
    };
    db::insert_appointment(&conn, &appointment)?;

    tracing::info!(appointment_id = %appointment.id, patient_id = %patient_id, "Appointment created");
    Ok(ApiResponse::created(appointment))
}

/// `GET /api/appointments/:id`
pub async fn detail(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AppointmentDetail>>, ApiError> {
    let id = parse_id(&id, "appointment")?;
    let conn = ctx.core.open_db()?;
    let appointment = db::get_appointment(&conn, &id)?.ok_or_else(|| appointment_not_found(&id))?;
    let patient = db::get_patient(&conn, &appointment.patient_id)?;
    let confirmations = db::get_confirmations_for_appointment(&conn, &id)?;
    Ok(ApiResponse::ok(AppointmentDetail {
        appointment,
        patient,
        confirmations,
    }))
}

/// `PUT /api/appointments/:id/status`
pub async fn update_status(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<ApiResponse<Appointment>>, ApiError> {
    let id = parse_id(&id, "appointment")?;
    let status = parse_status(&req.status)?;
    let conn = ctx.core.open_db()?;
    if !db::update_appointment_status(&conn, &id, status, &now())? {
        return Err(appointment_not_found(&id));
    }
    let appointment = db::get_appointment(&conn, &id)?.ok_or_else(|| appointment_not_found(&id))?;
    tracing::info!(appointment_id = %id, status = %status, "Appointment status updated");
    Ok(ApiResponse::ok(appointment))
}

/// `POST /api/appointments/:id/confirmation`
pub async fn send_confirmation_now(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AppointmentConfirmation>>, ApiError> {
    let id = parse_id(&id, "appointment")?;
    let confirmation = send_confirmation(&ctx.core, &id, now()).await?;
    Ok(ApiResponse::ok(confirmation))
}
