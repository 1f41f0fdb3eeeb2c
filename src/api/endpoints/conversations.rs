//! Conversation and message endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::types::{parse_id, ApiContext, ApiResponse};
use crate::db;
use crate::messaging::normalize_phone;
use crate::models::{Conversation, Message};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub phone: Option<String>,
}

/// `GET /api/conversations?phone=`: newest activity first.
pub async fn list(
    State(ctx): State<ApiContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Vec<Conversation>>>, ApiError> {
    let phone = match query.phone.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(raw) => Some(
            normalize_phone(raw, &ctx.core.config().default_country_code)
                .ok_or_else(|| ApiError::validation(format!("Invalid phone number: {raw}")))?,
        ),
        None => None,
    };
    let conn = ctx.core.open_db()?;
    let conversations = db::list_conversations(&conn, phone.as_deref())?;
    Ok(ApiResponse::ok(conversations))
}

/// `GET /api/conversations/:id/messages`: oldest first.
pub async fn messages(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<Message>>>, ApiError> {
    let id = parse_id(&id, "conversation")?;
    let conn = ctx.core.open_db()?;
    let history = ctx.core.sessions(&conn).history(id)?;
    Ok(ApiResponse::ok(history))
}

/// `PUT /api/messages/:id/read`
pub async fn mark_read(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Message>>, ApiError> {
    let id = parse_id(&id, "message")?;
    let conn = ctx.core.open_db()?;
    let not_found = || ApiError::not_found("MESSAGE_NOT_FOUND", format!("Message not found: {id}"));
    if !db::mark_message_read(&conn, &id)? {
        return Err(not_found());
    }
    let message = db::get_message(&conn, &id)?.ok_or_else(not_found)?;
    Ok(ApiResponse::ok(message))
}
