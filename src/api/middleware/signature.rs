//! Webhook signature middleware.
//!
//! When an app secret is configured, the raw body must carry a valid
//! `X-Hub-Signature-256`. The body is buffered, checked and handed on
//! unchanged.

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::messaging::webhook::{verify_signature, SIGNATURE_HEADER};

/// Upper bound on a buffered webhook delivery.
const MAX_WEBHOOK_BODY: usize = 1024 * 1024;

pub async fn verify_webhook(req: Request<Body>, next: Next) -> Response {
    match verify_inner(req, next).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn verify_inner(req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or_else(|| ApiError::Internal {
            code: "INTERNAL_ERROR",
            detail: "missing API context".into(),
        })?;

    let Some(secret) = ctx.core.config().whatsapp.app_secret.clone() else {
        return Ok(next.run(req).await);
    };

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY)
        .await
        .map_err(|_| ApiError::validation("Webhook payload too large"))?;
    let header = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    if !verify_signature(&secret, &bytes, header) {
        tracing::warn!(has_header = header.is_some(), "Webhook signature rejected");
        return Err(ApiError::InvalidSignature);
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
