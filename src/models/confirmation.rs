use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::AppointmentStatus;

/// One confirmation request sent to a patient and, once answered, its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentConfirmation {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub message_text: String,
    pub sent_at: NaiveDateTime,
    pub response_text: Option<String>,
    pub response_date: Option<NaiveDateTime>,
    pub final_status: Option<AppointmentStatus>,
    pub ai_confidence: Option<f32>,
    pub classifier_output: Option<serde_json::Value>,
}
