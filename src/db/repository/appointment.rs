use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{format_timestamp, optional, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::enums::AppointmentStatus;
use crate::models::Appointment;

const APPOINTMENT_COLUMNS: &str =
    "id, patient_id, scheduled_at, treatment, status, notes, created_at, updated_at";

pub fn insert_appointment(conn: &Connection, appt: &Appointment) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO appointments
         (id, patient_id, scheduled_at, treatment, status, notes, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            appt.id.to_string(),
            appt.patient_id.to_string(),
            format_timestamp(&appt.scheduled_at),
            appt.treatment,
            appt.status.as_str(),
            appt.notes,
            format_timestamp(&appt.created_at),
            format_timestamp(&appt.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_appointment(conn: &Connection, id: &Uuid) -> Result<Option<Appointment>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?1"),
        params![id.to_string()],
        AppointmentRow::read,
    ))?;
    row.map(appointment_from_row).transpose()
}

/// Last-writer-wins status update; no version check. Returns false when the
/// appointment does not exist.
pub fn update_appointment_status(
    conn: &Connection,
    id: &Uuid,
    status: AppointmentStatus,
    now: &NaiveDateTime,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE appointments SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), format_timestamp(now), id.to_string()],
    )?;
    Ok(changed == 1)
}

/// Next appointment for a patient that is still on the books.
pub fn next_appointment_for_patient(
    conn: &Connection,
    patient_id: &Uuid,
    now: &NaiveDateTime,
) -> Result<Option<Appointment>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments
             WHERE patient_id = ?1 AND scheduled_at >= ?2
               AND status IN ('planned', 'confirmed')
             ORDER BY scheduled_at ASC LIMIT 1"
        ),
        params![patient_id.to_string(), format_timestamp(now)],
        AppointmentRow::read,
    ))?;
    row.map(appointment_from_row).transpose()
}

/// Appointments in `status` whose start falls within `[from, to]`.
pub fn list_appointments_between(
    conn: &Connection,
    from: &NaiveDateTime,
    to: &NaiveDateTime,
    status: AppointmentStatus,
) -> Result<Vec<Appointment>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments
         WHERE scheduled_at >= ?1 AND scheduled_at <= ?2 AND status = ?3
         ORDER BY scheduled_at ASC"
    ))?;
    let rows = stmt.query_map(
        params![format_timestamp(from), format_timestamp(to), status.as_str()],
        AppointmentRow::read,
    )?;

    let mut appointments = Vec::new();
    for row in rows {
        appointments.push(appointment_from_row(row?)?);
    }
    Ok(appointments)
}

struct AppointmentRow {
    id: String,
    patient_id: String,
    scheduled_at: String,
    treatment: String,
    status: String,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
}

impl AppointmentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            scheduled_at: row.get(2)?,
            treatment: row.get(3)?,
            status: row.get(4)?,
            notes: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

fn appointment_from_row(row: AppointmentRow) -> Result<Appointment, DatabaseError> {
    Ok(Appointment {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        scheduled_at: parse_timestamp(&row.scheduled_at)?,
        treatment: row.treatment,
        status: AppointmentStatus::from_str(&row.status)?,
        notes: row.notes,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}
