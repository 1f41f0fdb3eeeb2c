use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{format_timestamp, optional, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::{LegalDocument, QuestionnaireResponse};

const DOCUMENT_COLUMNS: &str = "id, patient_id, appointment_id, flow_id, document_ref, accepted, \
                                accepted_at, ip_address, user_agent, created_at";

pub fn insert_legal_document(conn: &Connection, doc: &LegalDocument) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO legal_documents
         (id, patient_id, appointment_id, flow_id, document_ref, accepted, accepted_at,
          ip_address, user_agent, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            doc.id.to_string(),
            doc.patient_id.to_string(),
            doc.appointment_id.map(|id| id.to_string()),
            doc.flow_id.map(|id| id.to_string()),
            doc.document_ref,
            doc.accepted,
            doc.accepted_at.as_ref().map(format_timestamp),
            doc.ip_address,
            doc.user_agent,
            format_timestamp(&doc.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_legal_document(
    conn: &Connection,
    id: &Uuid,
) -> Result<Option<LegalDocument>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!("SELECT {DOCUMENT_COLUMNS} FROM legal_documents WHERE id = ?1"),
        params![id.to_string()],
        DocumentRow::read,
    ))?;
    row.map(document_from_row).transpose()
}

pub fn get_legal_documents_for_flow(
    conn: &Connection,
    flow_id: &Uuid,
) -> Result<Vec<LegalDocument>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DOCUMENT_COLUMNS} FROM legal_documents WHERE flow_id = ?1 ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map(params![flow_id.to_string()], DocumentRow::read)?;

    let mut docs = Vec::new();
    for row in rows {
        docs.push(document_from_row(row?)?);
    }
    Ok(docs)
}

/// Record acceptance once. The guarded UPDATE only touches rows not yet
/// accepted, so a repeat call leaves `accepted_at`, IP and user agent as first
/// captured. Returns the stored document, or `NotFound`.
pub fn accept_legal_document(
    conn: &Connection,
    id: &Uuid,
    at: &NaiveDateTime,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
) -> Result<LegalDocument, DatabaseError> {
    conn.execute(
        "UPDATE legal_documents
         SET accepted = 1, accepted_at = ?1, ip_address = ?2, user_agent = ?3
         WHERE id = ?4 AND accepted = 0",
        params![format_timestamp(at), ip_address, user_agent, id.to_string()],
    )?;
    get_legal_document(conn, id)?.ok_or_else(|| DatabaseError::NotFound {
        entity_type: "LegalDocument".into(),
        id: id.to_string(),
    })
}

pub fn insert_questionnaire_response(
    conn: &Connection,
    response: &QuestionnaireResponse,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO questionnaire_responses
         (id, patient_id, appointment_id, flow_id, questionnaire, responses, lopd_accepted, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            response.id.to_string(),
            response.patient_id.to_string(),
            response.appointment_id.map(|id| id.to_string()),
            response.flow_id.map(|id| id.to_string()),
            response.questionnaire.to_string(),
            response.responses.to_string(),
            response.lopd_accepted,
            format_timestamp(&response.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_questionnaire_responses_for_flow(
    conn: &Connection,
    flow_id: &Uuid,
) -> Result<Vec<QuestionnaireResponse>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, patient_id, appointment_id, flow_id, questionnaire, responses,
                lopd_accepted, created_at
         FROM questionnaire_responses WHERE flow_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![flow_id.to_string()], |row| {
        Ok(QuestionnaireRow {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            appointment_id: row.get(2)?,
            flow_id: row.get(3)?,
            questionnaire: row.get(4)?,
            responses: row.get(5)?,
            lopd_accepted: row.get(6)?,
            created_at: row.get(7)?,
        })
    })?;

    let mut responses = Vec::new();
    for row in rows {
        responses.push(questionnaire_from_row(row?)?);
    }
    Ok(responses)
}

struct DocumentRow {
    id: String,
    patient_id: String,
    appointment_id: Option<String>,
    flow_id: Option<String>,
    document_ref: String,
    accepted: bool,
    accepted_at: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    created_at: String,
}

impl DocumentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            appointment_id: row.get(2)?,
            flow_id: row.get(3)?,
            document_ref: row.get(4)?,
            accepted: row.get(5)?,
            accepted_at: row.get(6)?,
            ip_address: row.get(7)?,
            user_agent: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

fn document_from_row(row: DocumentRow) -> Result<LegalDocument, DatabaseError> {
    Ok(LegalDocument {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        appointment_id: row.appointment_id.as_deref().map(parse_uuid).transpose()?,
        flow_id: row.flow_id.as_deref().map(parse_uuid).transpose()?,
        document_ref: row.document_ref,
        accepted: row.accepted,
        accepted_at: row.accepted_at.as_deref().map(parse_timestamp).transpose()?,
        ip_address: row.ip_address,
        user_agent: row.user_agent,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

struct QuestionnaireRow {
    id: String,
    patient_id: String,
    appointment_id: Option<String>,
    flow_id: Option<String>,
    questionnaire: String,
    responses: String,
    lopd_accepted: bool,
    created_at: String,
}

fn questionnaire_from_row(row: QuestionnaireRow) -> Result<QuestionnaireResponse, DatabaseError> {
    let json = |column: &str, raw: &str| -> Result<serde_json::Value, DatabaseError> {
        serde_json::from_str(raw).map_err(|e| DatabaseError::MalformedJson {
            column: column.into(),
            reason: e.to_string(),
        })
    };
    Ok(QuestionnaireResponse {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        appointment_id: row.appointment_id.as_deref().map(parse_uuid).transpose()?,
        flow_id: row.flow_id.as_deref().map(parse_uuid).transpose()?,
        questionnaire: json("questionnaire", &row.questionnaire)?,
        responses: json("responses", &row.responses)?,
        lopd_accepted: row.lopd_accepted,
        created_at: parse_timestamp(&row.created_at)?,
    })
}
