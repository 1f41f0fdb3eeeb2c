//! WhatsApp webhook endpoints.
//!
//! `GET /webhook` answers the provider's subscription handshake.
//! `POST /webhook` receives message deliveries; the signature is checked
//! by middleware before this handler runs.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::Json;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::types::{now, ApiContext, ApiResponse};
use crate::conversation::mask_phone;
use crate::messaging::webhook::{extract_messages, verify_subscription, WebhookPayload};
use crate::messaging::{process_message, InboundRequest};

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// `GET /webhook?hub.mode=subscribe&hub.verify_token=..&hub.challenge=..`
pub async fn verify(
    State(ctx): State<ApiContext>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, ApiError> {
    let param = |key: &str| params.get(key).map(String::as_str);
    verify_subscription(
        param("hub.mode"),
        param("hub.verify_token"),
        param("hub.challenge"),
        ctx.core.config().whatsapp.verify_token.as_deref(),
    )
    .ok_or_else(|| {
        tracing::warn!("Webhook verification rejected");
        ApiError::VerificationFailed
    })
}

/// `POST /webhook`
///
/// Malformed JSON is rejected. Once parsed, the delivery is always
/// acknowledged: per-message failures are logged, never returned, so the
/// provider does not redeliver.
pub async fn receive(
    State(ctx): State<ApiContext>,
    body: Bytes,
) -> Result<Json<ApiResponse<DeliveryReceipt>>, ApiError> {
    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::validation(format!("Malformed webhook payload: {e}")))?;

    let events = extract_messages(&payload);
    let mut receipt = DeliveryReceipt {
        received: events.len(),
        ..DeliveryReceipt::default()
    };

    for event in events {
        let from = mask_phone(&event.from);
        let inbound = InboundRequest {
            phone: event.from,
            text: event.text,
            button_payload: event.button_payload,
            external_id: Some(event.external_id),
            message_type: event.message_type,
            received_at: event.sent_at.unwrap_or_else(now),
        };
        match process_message(&ctx.core, inbound).await {
            Ok(outcome) if outcome.duplicate => receipt.duplicates += 1,
            Ok(_) => receipt.processed += 1,
            Err(e) => {
                tracing::warn!(phone = %from, error = %e, "Inbound message not processed");
                receipt.failed += 1;
            }
        }
    }

    Ok(ApiResponse::ok(receipt))
}
