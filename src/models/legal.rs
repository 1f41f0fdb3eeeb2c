use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Consent record. `accepted` flips to true at most once; `accepted_at`,
/// `ip_address` and `user_agent` are captured at that moment and never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegalDocument {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub flow_id: Option<Uuid>,
    /// Template/document reference from the flow step (`documentId`).
    pub document_ref: String,
    pub accepted: bool,
    pub accepted_at: Option<NaiveDateTime>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireResponse {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub flow_id: Option<Uuid>,
    pub questionnaire: serde_json::Value,
    pub responses: serde_json::Value,
    pub lopd_accepted: bool,
    pub created_at: NaiveDateTime,
}
