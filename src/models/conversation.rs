use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{
    ConversationStatus, IntentAction, MessageDirection, MessageType, UrgencyLevel,
};

/// Colour tag set on conversations holding a critical inbound message.
pub const URGENT_COLOR_TAG: &str = "urgent";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub phone_number: String,
    pub patient_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub status: ConversationStatus,
    pub color_tag: Option<String>,
    pub last_activity_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

/// Triage annotation stored alongside an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiMetadata {
    pub confidence: f32,
    pub intent: IntentAction,
    pub urgency_level: UrgencyLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub direction: MessageDirection,
    pub text: String,
    pub message_type: MessageType,
    /// Provider message id (inbound dedup key / outbound delivery id).
    pub external_id: Option<String>,
    pub sent_at: NaiveDateTime,
    pub is_read: bool,
    pub ai_metadata: Option<AiMetadata>,
}
