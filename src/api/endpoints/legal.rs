//! Legal document acceptance.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;

use crate::api::error::ApiError;
use crate::api::types::{now, parse_id, request_meta, ApiContext, ApiResponse};
use crate::db::{self, DatabaseError};
use crate::models::LegalDocument;

/// `POST /api/legal/documents/:id/accept`: idempotent; a repeat accept
/// returns the original acceptance unchanged.
pub async fn accept(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<LegalDocument>>, ApiError> {
    let id = parse_id(&id, "document")?;
    let meta = request_meta(&headers);
    let conn = ctx.core.open_db()?;
    let document = db::accept_legal_document(
        &conn,
        &id,
        &now(),
        meta.ip_address.as_deref(),
        meta.user_agent.as_deref(),
    )
    .map_err(|e| match e {
        DatabaseError::NotFound { .. } => {
            ApiError::not_found("DOCUMENT_NOT_FOUND", format!("Legal document not found: {id}"))
        }
        other => other.into(),
    })?;
    tracing::info!(document_id = %id, accepted_at = ?document.accepted_at, "Legal document accepted");
    Ok(ApiResponse::ok(document))
}
