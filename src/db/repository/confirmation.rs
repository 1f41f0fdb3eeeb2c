use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{format_timestamp, optional, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::enums::AppointmentStatus;
use crate::models::AppointmentConfirmation;

const CONFIRMATION_COLUMNS: &str = "id, appointment_id, conversation_id, message_text, sent_at, \
                                    response_text, response_date, final_status, ai_confidence, \
                                    classifier_output";

pub fn insert_confirmation(
    conn: &Connection,
    confirmation: &AppointmentConfirmation,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO appointment_confirmations
         (id, appointment_id, conversation_id, message_text, sent_at, response_text,
          response_date, final_status, ai_confidence, classifier_output)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            confirmation.id.to_string(),
            confirmation.appointment_id.to_string(),
            confirmation.conversation_id.map(|id| id.to_string()),
            confirmation.message_text,
            format_timestamp(&confirmation.sent_at),
            confirmation.response_text,
            confirmation.response_date.as_ref().map(format_timestamp),
            confirmation.final_status.map(|s| s.as_str()),
            confirmation.ai_confidence,
            confirmation.classifier_output.as_ref().map(|v| v.to_string()),
        ],
    )?;
    Ok(())
}

/// Release a reservation whose message could not be delivered, so the next
/// pass may retry. Answered rows are never removed.
pub fn delete_unanswered_confirmation(conn: &Connection, id: &Uuid) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM appointment_confirmations WHERE id = ?1 AND response_date IS NULL",
        params![id.to_string()],
    )?;
    Ok(changed == 1)
}

/// True when a confirmation for this appointment was sent at or after `since`.
pub fn confirmation_sent_since(
    conn: &Connection,
    appointment_id: &Uuid,
    since: &NaiveDateTime,
) -> Result<bool, DatabaseError> {
    let sent = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM appointment_confirmations
                       WHERE appointment_id = ?1 AND sent_at >= ?2)",
        params![appointment_id.to_string(), format_timestamp(since)],
        |row| row.get::<_, bool>(0),
    )?;
    Ok(sent)
}

/// Latest unanswered confirmation for an appointment.
pub fn pending_confirmation_for_appointment(
    conn: &Connection,
    appointment_id: &Uuid,
) -> Result<Option<AppointmentConfirmation>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!(
            "SELECT {CONFIRMATION_COLUMNS} FROM appointment_confirmations
             WHERE appointment_id = ?1 AND response_date IS NULL
             ORDER BY sent_at DESC LIMIT 1"
        ),
        params![appointment_id.to_string()],
        ConfirmationRow::read,
    ))?;
    row.map(confirmation_from_row).transpose()
}

/// Latest unanswered confirmation sent on this conversation or for any of
/// the patient's appointments.
pub fn pending_confirmation_for_conversation(
    conn: &Connection,
    conversation_id: &Uuid,
    patient_id: Option<&Uuid>,
) -> Result<Option<AppointmentConfirmation>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!(
            "SELECT {CONFIRMATION_COLUMNS} FROM appointment_confirmations
             WHERE response_date IS NULL
               AND (conversation_id = ?1
                    OR appointment_id IN (SELECT id FROM appointments WHERE patient_id = ?2))
             ORDER BY sent_at DESC LIMIT 1"
        ),
        params![conversation_id.to_string(), patient_id.map(|id| id.to_string())],
        ConfirmationRow::read,
    ))?;
    row.map(confirmation_from_row).transpose()
}

pub fn get_confirmations_for_appointment(
    conn: &Connection,
    appointment_id: &Uuid,
) -> Result<Vec<AppointmentConfirmation>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONFIRMATION_COLUMNS} FROM appointment_confirmations
         WHERE appointment_id = ?1 ORDER BY sent_at ASC"
    ))?;
    let rows = stmt.query_map(params![appointment_id.to_string()], ConfirmationRow::read)?;

    let mut confirmations = Vec::new();
    for row in rows {
        confirmations.push(confirmation_from_row(row?)?);
    }
    Ok(confirmations)
}

/// Store the patient's answer on a pending confirmation. Only unanswered rows
/// are updated; returns false when the row was already answered.
pub fn record_confirmation_response(
    conn: &Connection,
    id: &Uuid,
    response_text: &str,
    response_date: &NaiveDateTime,
    final_status: Option<AppointmentStatus>,
    ai_confidence: f32,
    classifier_output: &serde_json::Value,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE appointment_confirmations
         SET response_text = ?1, response_date = ?2, final_status = ?3, ai_confidence = ?4,
             classifier_output = ?5
         WHERE id = ?6 AND response_date IS NULL",
        params![
            response_text,
            format_timestamp(response_date),
            final_status.map(|s| s.as_str()),
            ai_confidence,
            classifier_output.to_string(),
            id.to_string(),
        ],
    )?;
    Ok(changed == 1)
}

struct ConfirmationRow {
    id: String,
    appointment_id: String,
    conversation_id: Option<String>,
    message_text: String,
    sent_at: String,
    response_text: Option<String>,
    response_date: Option<String>,
    final_status: Option<String>,
    ai_confidence: Option<f32>,
    classifier_output: Option<String>,
}

impl ConfirmationRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            appointment_id: row.get(1)?,
            conversation_id: row.get(2)?,
            message_text: row.get(3)?,
            sent_at: row.get(4)?,
            response_text: row.get(5)?,
            response_date: row.get(6)?,
            final_status: row.get(7)?,
            ai_confidence: row.get(8)?,
            classifier_output: row.get(9)?,
        })
    }
}

fn confirmation_from_row(row: ConfirmationRow) -> Result<AppointmentConfirmation, DatabaseError> {
    let classifier_output = row
        .classifier_output
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| DatabaseError::MalformedJson {
            column: "classifier_output".into(),
            reason: e.to_string(),
        })?;
    Ok(AppointmentConfirmation {
        id: parse_uuid(&row.id)?,
        appointment_id: parse_uuid(&row.appointment_id)?,
        conversation_id: row.conversation_id.as_deref().map(parse_uuid).transpose()?,
        message_text: row.message_text,
        sent_at: parse_timestamp(&row.sent_at)?,
        response_text: row.response_text,
        response_date: row.response_date.as_deref().map(parse_timestamp).transpose()?,
        final_status: row
            .final_status
            .as_deref()
            .map(AppointmentStatus::from_str)
            .transpose()?,
        ai_confidence: row.ai_confidence,
        classifier_output,
    })
}
