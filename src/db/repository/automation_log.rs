use std::str::FromStr;

use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{format_timestamp, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::enums::AutomationAction;
use crate::models::AutomationLog;

const LOG_COLUMNS: &str = "id, appointment_id, flow_id, action_type, action_data, success, \
                           error_message, created_at";

pub fn insert_automation_log(conn: &Connection, log: &AutomationLog) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO automation_logs
         (id, appointment_id, flow_id, action_type, action_data, success, error_message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            log.id.to_string(),
            log.appointment_id.map(|id| id.to_string()),
            log.flow_id.map(|id| id.to_string()),
            log.action_type.as_str(),
            log.action_data.to_string(),
            log.success,
            log.error_message,
            format_timestamp(&log.created_at),
        ],
    )?;
    Ok(())
}

/// Batch insert in one transaction. Used by the audit writer when it drains
/// its queue.
pub fn insert_automation_logs(
    conn: &mut Connection,
    logs: &[AutomationLog],
) -> Result<(), DatabaseError> {
    let tx = conn.transaction()?;
    for log in logs {
        insert_automation_log(&tx, log)?;
    }
    tx.commit()?;
    Ok(())
}

pub fn get_logs_for_flow(conn: &Connection, flow_id: &Uuid) -> Result<Vec<AutomationLog>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOG_COLUMNS} FROM automation_logs WHERE flow_id = ?1
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map(params![flow_id.to_string()], LogRow::read)?;
    collect_logs(rows)
}

pub fn get_logs_by_action(
    conn: &Connection,
    action: AutomationAction,
) -> Result<Vec<AutomationLog>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOG_COLUMNS} FROM automation_logs WHERE action_type = ?1
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map(params![action.as_str()], LogRow::read)?;
    collect_logs(rows)
}

/// (successful, failed) log counts.
pub fn count_log_outcomes(conn: &Connection) -> Result<(i64, i64), DatabaseError> {
    let counts = conn.query_row(
        "SELECT COALESCE(SUM(success = 1), 0), COALESCE(SUM(success = 0), 0) FROM automation_logs",
        [],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
    )?;
    Ok(counts)
}

fn collect_logs(
    rows: impl Iterator<Item = rusqlite::Result<LogRow>>,
) -> Result<Vec<AutomationLog>, DatabaseError> {
    let mut logs = Vec::new();
    for row in rows {
        logs.push(log_from_row(row?)?);
    }
    Ok(logs)
}

struct LogRow {
    id: String,
    appointment_id: Option<String>,
    flow_id: Option<String>,
    action_type: String,
    action_data: String,
    success: bool,
    error_message: Option<String>,
    created_at: String,
}

impl LogRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            appointment_id: row.get(1)?,
            flow_id: row.get(2)?,
            action_type: row.get(3)?,
            action_data: row.get(4)?,
            success: row.get(5)?,
            error_message: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

fn log_from_row(row: LogRow) -> Result<AutomationLog, DatabaseError> {
    let action_data =
        serde_json::from_str(&row.action_data).map_err(|e| DatabaseError::MalformedJson {
            column: "action_data".into(),
            reason: e.to_string(),
        })?;
    Ok(AutomationLog {
        id: parse_uuid(&row.id)?,
        appointment_id: row.appointment_id.as_deref().map(parse_uuid).transpose()?,
        flow_id: row.flow_id.as_deref().map(parse_uuid).transpose()?,
        action_type: AutomationAction::from_str(&row.action_type)?,
        action_data,
        success: row.success,
        error_message: row.error_message,
        created_at: parse_timestamp(&row.created_at)?,
    })
}
