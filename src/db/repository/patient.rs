use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{format_timestamp, optional, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::Patient;

const PATIENT_COLUMNS: &str = "id, first_name, last_name, phone, email, created_at";

pub fn insert_patient(conn: &Connection, patient: &Patient) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO patients (id, first_name, last_name, phone, email, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            patient.id.to_string(),
            patient.first_name,
            patient.last_name,
            patient.phone,
            patient.email,
            format_timestamp(&patient.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_patient(conn: &Connection, id: &Uuid) -> Result<Option<Patient>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE id = ?1"),
        params![id.to_string()],
        PatientRow::read,
    ))?;
    row.map(patient_from_row).transpose()
}

/// Look up a patient by normalized phone. Most recently created wins when
/// a number is shared (family members).
pub fn find_patient_by_phone(
    conn: &Connection,
    phone: &str,
) -> Result<Option<Patient>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!(
            "SELECT {PATIENT_COLUMNS} FROM patients WHERE phone = ?1
             ORDER BY created_at DESC LIMIT 1"
        ),
        params![phone],
        PatientRow::read,
    ))?;
    row.map(patient_from_row).transpose()
}

struct PatientRow {
    id: String,
    first_name: String,
    last_name: String,
    phone: String,
    email: Option<String>,
    created_at: String,
}

impl PatientRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            phone: row.get(3)?,
            email: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

fn patient_from_row(row: PatientRow) -> Result<Patient, DatabaseError> {
    Ok(Patient {
        id: parse_uuid(&row.id)?,
        first_name: row.first_name,
        last_name: row.last_name,
        phone: row.phone,
        email: row.email,
        created_at: parse_timestamp(&row.created_at)?,
    })
}
