//! Shared types for the HTTP layer.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDateTime;
use serde::Serialize;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::automation::RequestMeta;
use crate::core_state::CoreState;

/// Shared context for all routes and middleware.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        Self { core }
    }
}

/// Success envelope: `{ "success": true, "data": ... }`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }

    pub fn created(data: T) -> Response {
        (StatusCode::CREATED, Self::ok(data)).into_response()
    }
}

/// Path ids arrive as strings so a malformed one maps to our own 400 body.
pub fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::validation(format!("Invalid {what} id: {raw}")))
}

/// Local wall-clock time, the reference for every stored timestamp.
pub fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Requester details recorded on legal acceptance.
pub fn request_meta(headers: &HeaderMap) -> RequestMeta {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    RequestMeta {
        ip_address: header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()))
            .or_else(|| header("x-real-ip")),
        user_agent: header("user-agent"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn request_meta_takes_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.7, 172.16.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));
        let meta = request_meta(&headers);
        assert_eq!(meta.ip_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(meta.user_agent.as_deref(), Some("Mozilla/5.0"));
    }

    #[test]
    fn request_meta_empty_without_headers() {
        let meta = request_meta(&HeaderMap::new());
        assert!(meta.ip_address.is_none());
        assert!(meta.user_agent.is_none());
    }

    #[test]
    fn parse_id_rejects_garbage() {
        assert!(parse_id("not-a-uuid", "flow").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string(), "flow").unwrap(), id);
    }
}
