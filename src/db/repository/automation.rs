use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{format_timestamp, optional, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::enums::FlowStatus;
use crate::models::{AutomationFlow, FlowConfig};

const FLOW_COLUMNS: &str = "id, appointment_id, flow_type, flow_config, current_step_index, \
                            status, version, created_at, updated_at";

pub fn insert_flow(conn: &Connection, flow: &AutomationFlow) -> Result<(), DatabaseError> {
    let config = serde_json::to_string(&flow.config).map_err(|e| DatabaseError::MalformedJson {
        column: "flow_config".into(),
        reason: e.to_string(),
    })?;
    conn.execute(
        "INSERT INTO automation_flows
         (id, appointment_id, flow_type, flow_config, current_step_index, status, version,
          created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            flow.id.to_string(),
            flow.appointment_id.to_string(),
            flow.flow_type,
            config,
            flow.current_step_index as i64,
            flow.status.as_str(),
            flow.version,
            format_timestamp(&flow.created_at),
            format_timestamp(&flow.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_flow(conn: &Connection, id: &Uuid) -> Result<Option<AutomationFlow>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!("SELECT {FLOW_COLUMNS} FROM automation_flows WHERE id = ?1"),
        params![id.to_string()],
        FlowRow::read,
    ))?;
    row.map(flow_from_row).transpose()
}

pub fn find_active_flow_for_appointment(
    conn: &Connection,
    appointment_id: &Uuid,
) -> Result<Option<AutomationFlow>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!(
            "SELECT {FLOW_COLUMNS} FROM automation_flows
             WHERE appointment_id = ?1 AND status = 'active'
             ORDER BY created_at DESC LIMIT 1"
        ),
        params![appointment_id.to_string()],
        FlowRow::read,
    ))?;
    row.map(flow_from_row).transpose()
}

/// Most recently touched active flow on any of the patient's appointments.
pub fn find_active_flow_for_patient(
    conn: &Connection,
    patient_id: &Uuid,
) -> Result<Option<AutomationFlow>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!(
            "SELECT {FLOW_COLUMNS} FROM automation_flows
             WHERE status = 'active'
               AND appointment_id IN (SELECT id FROM appointments WHERE patient_id = ?1)
             ORDER BY updated_at DESC, created_at DESC LIMIT 1"
        ),
        params![patient_id.to_string()],
        FlowRow::read,
    ))?;
    row.map(flow_from_row).transpose()
}

/// Compare-and-swap the step pointer. Succeeds only when the row still holds
/// `expected_index` at `expected_version` and is active; bumps the version.
/// Returns false when another writer got there first.
pub fn advance_flow(
    conn: &Connection,
    id: &Uuid,
    expected_index: usize,
    expected_version: i64,
    new_index: usize,
    new_status: FlowStatus,
    now: &NaiveDateTime,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE automation_flows
         SET current_step_index = ?1, status = ?2, version = version + 1, updated_at = ?3
         WHERE id = ?4 AND current_step_index = ?5 AND version = ?6 AND status = 'active'",
        params![
            new_index as i64,
            new_status.as_str(),
            format_timestamp(now),
            id.to_string(),
            expected_index as i64,
            expected_version,
        ],
    )?;
    Ok(changed == 1)
}

/// Unconditional lifecycle write (pause/resume/cancel). Bumps the version so
/// an in-flight step submission loses its compare-and-swap.
pub fn set_flow_status(
    conn: &Connection,
    id: &Uuid,
    status: FlowStatus,
    now: &NaiveDateTime,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE automation_flows SET status = ?1, version = version + 1, updated_at = ?2
         WHERE id = ?3",
        params![status.as_str(), format_timestamp(now), id.to_string()],
    )?;
    Ok(changed == 1)
}

pub fn list_flows_by_status(
    conn: &Connection,
    status: FlowStatus,
) -> Result<Vec<AutomationFlow>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FLOW_COLUMNS} FROM automation_flows WHERE status = ?1
         ORDER BY updated_at DESC"
    ))?;
    let rows = stmt.query_map(params![status.as_str()], FlowRow::read)?;

    let mut flows = Vec::new();
    for row in rows {
        flows.push(flow_from_row(row?)?);
    }
    Ok(flows)
}

/// Flow counts keyed by status; statuses with no rows are absent.
pub fn count_flows_by_status(
    conn: &Connection,
) -> Result<BTreeMap<FlowStatus, i64>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM automation_flows GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = BTreeMap::new();
    for row in rows {
        let (status, count) = row?;
        counts.insert(FlowStatus::from_str(&status)?, count);
    }
    Ok(counts)
}

struct FlowRow {
    id: String,
    appointment_id: String,
    flow_type: String,
    flow_config: String,
    current_step_index: i64,
    status: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl FlowRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            appointment_id: row.get(1)?,
            flow_type: row.get(2)?,
            flow_config: row.get(3)?,
            current_step_index: row.get(4)?,
            status: row.get(5)?,
            version: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

fn flow_from_row(row: FlowRow) -> Result<AutomationFlow, DatabaseError> {
    let config: FlowConfig =
        serde_json::from_str(&row.flow_config).map_err(|e| DatabaseError::MalformedJson {
            column: "flow_config".into(),
            reason: e.to_string(),
        })?;
    let current_step_index = usize::try_from(row.current_step_index).map_err(|_| {
        DatabaseError::ConstraintViolation(format!(
            "negative step index {} on flow {}",
            row.current_step_index, row.id
        ))
    })?;
    Ok(AutomationFlow {
        id: parse_uuid(&row.id)?,
        appointment_id: parse_uuid(&row.appointment_id)?,
        flow_type: row.flow_type,
        config,
        current_step_index,
        status: FlowStatus::from_str(&row.status)?,
        version: row.version,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}
