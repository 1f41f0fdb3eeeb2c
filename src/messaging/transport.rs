//! Outbound message delivery.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::WhatsAppConfig;
use crate::conversation::mask_phone;
use crate::models::ButtonOption;

/// Interactive messages carry at most this many reply buttons.
pub const MAX_REPLY_BUTTONS: usize = 3;

/// Reply button titles are cut to this many characters.
const BUTTON_TITLE_LIMIT: usize = 20;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Cannot reach messaging provider: {0}")]
    Connection(String),

    #[error("Messaging provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Malformed provider response: {0}")]
    ResponseParsing(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub to: String,
    pub text: String,
    pub buttons: Vec<ButtonOption>,
}

impl OutboundMessage {
    pub fn text(to: &str, text: &str) -> Self {
        Self {
            to: to.to_string(),
            text: text.to_string(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, buttons: &[ButtonOption]) -> Self {
        self.buttons = buttons.to_vec();
        self
    }
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver one message. Returns the provider's message id when known.
    async fn send(&self, message: &OutboundMessage) -> Result<Option<String>, TransportError>;
}

/// WhatsApp Cloud API (`POST {api}/{phone_number_id}/messages`).
pub struct WhatsAppCloudTransport {
    endpoint: String,
    access_token: String,
    client: reqwest::Client,
}

impl WhatsAppCloudTransport {
    pub fn new(
        api_url: &str,
        phone_number_id: &str,
        access_token: &str,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| TransportError::HttpClient(e.to_string()))?;
        Ok(Self {
            endpoint: format!("{}/{}/messages", api_url.trim_end_matches('/'), phone_number_id),
            access_token: access_token.to_string(),
            client,
        })
    }
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Deserialize)]
struct SentMessage {
    id: String,
}

/// Request body for the Cloud API. More than [`MAX_REPLY_BUTTONS`] options
/// fall back to a numbered text list.
fn request_body(message: &OutboundMessage) -> serde_json::Value {
    if message.buttons.is_empty() {
        return json!({
            "messaging_product": "whatsapp",
            "to": message.to,
            "type": "text",
            "text": { "body": message.text },
        });
    }

    if message.buttons.len() > MAX_REPLY_BUTTONS {
        let options: Vec<String> = message
            .buttons
            .iter()
            .enumerate()
            .map(|(i, b)| format!("{}. {}", i + 1, b.label))
            .collect();
        return json!({
            "messaging_product": "whatsapp",
            "to": message.to,
            "type": "text",
            "text": { "body": format!("{}\n\n{}", message.text, options.join("\n")) },
        });
    }

    let buttons: Vec<serde_json::Value> = message
        .buttons
        .iter()
        .map(|b| {
            let title: String = b.label.chars().take(BUTTON_TITLE_LIMIT).collect();
            json!({ "type": "reply", "reply": { "id": b.value, "title": title } })
        })
        .collect();
    json!({
        "messaging_product": "whatsapp",
        "to": message.to,
        "type": "interactive",
        "interactive": {
            "type": "button",
            "body": { "text": message.text },
            "action": { "buttons": buttons },
        },
    })
}

#[async_trait]
impl MessageTransport for WhatsAppCloudTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<Option<String>, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&request_body(message))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    TransportError::Connection(e.to_string())
                } else {
                    TransportError::HttpClient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| TransportError::ResponseParsing(e.to_string()))?;
        Ok(parsed.messages.into_iter().next().map(|m| m.id))
    }
}

/// Used when no provider credentials are configured.
pub struct LogOnlyTransport;

#[async_trait]
impl MessageTransport for LogOnlyTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<Option<String>, TransportError> {
        tracing::info!(
            to = %mask_phone(&message.to),
            buttons = message.buttons.len(),
            chars = message.text.chars().count(),
            "Outbound message (log-only transport)"
        );
        Ok(None)
    }
}

/// Cloud transport when credentials exist, log-only otherwise.
pub fn transport_from_config(
    config: &WhatsAppConfig,
) -> Result<Arc<dyn MessageTransport>, TransportError> {
    match config.credentials() {
        Some((phone_number_id, token)) => Ok(Arc::new(WhatsAppCloudTransport::new(
            &config.api_url,
            phone_number_id,
            token,
        )?)),
        None => {
            tracing::warn!("WhatsApp credentials not configured; outbound messages are only logged");
            Ok(Arc::new(LogOnlyTransport))
        }
    }
}

/// Captures outbound messages for assertions.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingTransport {
    sent: std::sync::Mutex<Vec<OutboundMessage>>,
    pub fail: bool,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<Option<String>, TransportError> {
        if self.fail {
            return Err(TransportError::Provider {
                status: 500,
                body: "unavailable".into(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(Some(format!("wamid.test-{}", sent.len())))
    }
}
