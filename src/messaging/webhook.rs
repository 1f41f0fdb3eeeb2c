//! WhatsApp Cloud API webhook: subscription handshake, payload signature
//! and inbound message extraction.

use chrono::{DateTime, Local, NaiveDateTime};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::models::enums::MessageType;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` over the raw request body.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: WebhookValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookValue {
    #[serde(default)]
    pub messages: Vec<WebhookMessage>,
    /// Delivery receipts. Acknowledged, not processed.
    #[serde(default)]
    pub statuses: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMessage {
    pub from: String,
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub interactive: Option<Interactive>,
    #[serde(default)]
    pub button: Option<TemplateButton>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextBody {
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Interactive {
    #[serde(default)]
    pub button_reply: Option<ReplyChoice>,
    #[serde(default)]
    pub list_reply: Option<ReplyChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyChoice {
    pub id: String,
    pub title: String,
}

/// Quick-reply button on a template message.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateButton {
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// One patient message pulled out of a webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub from: String,
    pub external_id: String,
    pub text: String,
    pub button_payload: Option<String>,
    pub message_type: MessageType,
    pub sent_at: Option<NaiveDateTime>,
}

/// Every message in the delivery that carries text or a button reply.
/// Media and other unsupported types are skipped.
pub fn extract_messages(payload: &WebhookPayload) -> Vec<InboundEvent> {
    payload
        .entry
        .iter()
        .flat_map(|entry| entry.changes.iter())
        .flat_map(|change| change.value.messages.iter())
        .filter_map(|message| {
            let event = to_event(message);
            if event.is_none() {
                tracing::debug!(
                    message_id = %message.id,
                    kind = message.kind.as_deref().unwrap_or("unknown"),
                    "Skipping unsupported webhook message"
                );
            }
            event
        })
        .collect()
}

fn to_event(message: &WebhookMessage) -> Option<InboundEvent> {
    let (text, button_payload, message_type) = if let Some(text) = &message.text {
        (text.body.clone(), None, MessageType::Text)
    } else if let Some(interactive) = &message.interactive {
        let choice = interactive
            .button_reply
            .as_ref()
            .or(interactive.list_reply.as_ref())?;
        (choice.title.clone(), Some(choice.id.clone()), MessageType::Interactive)
    } else if let Some(button) = &message.button {
        let text = button.text.clone().or_else(|| button.payload.clone())?;
        (text, button.payload.clone(), MessageType::Button)
    } else {
        return None;
    };

    Some(InboundEvent {
        from: message.from.clone(),
        external_id: message.id.clone(),
        text,
        button_payload,
        message_type,
        sent_at: message.timestamp.as_deref().and_then(parse_epoch),
    })
}

/// Provider timestamps are Unix seconds; stored times are local.
fn parse_epoch(raw: &str) -> Option<NaiveDateTime> {
    let secs: i64 = raw.trim().parse().ok()?;
    DateTime::from_timestamp(secs, 0).map(|utc| utc.with_timezone(&Local).naive_local())
}

/// Subscription handshake: echo the challenge iff the verify token matches.
pub fn verify_subscription(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    expected_token: Option<&str>,
) -> Option<String> {
    let expected = expected_token?;
    if mode != Some("subscribe") {
        return None;
    }
    let token = token?;
    if token.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 0 {
        return None;
    }
    challenge.map(str::to_string)
}

/// Check `sha256=<hex>` against the HMAC-SHA256 of `body` under `secret`.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(provided) = header
        .and_then(|h| h.trim().strip_prefix("sha256="))
        .and_then(decode_hex)
    else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    expected.as_slice().ct_eq(provided.as_slice()).unwrap_u8() == 1
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(raw.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    let hex: String = mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    format!("sha256={hex}")
}
