//! Automation flows: per-appointment step sequences walked one patient
//! response at a time.

pub mod engine;
pub mod validation;

pub use engine::*;
pub use validation::{check_flow_config, parse_flow_config};

use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::enums::FlowStatus;

#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("Appointment not found: {0}")]
    AppointmentNotFound(Uuid),

    #[error("Flow not found: {0}")]
    FlowNotFound(Uuid),

    #[error("Flow {0} not found or not active")]
    FlowNotFoundOrInactive(Uuid),

    #[error("Appointment {appointment_id} already has active flow {flow_id}")]
    FlowAlreadyExists { appointment_id: Uuid, flow_id: Uuid },

    #[error("Invalid flow configuration: {0}")]
    InvalidFlowConfig(String),

    #[error("Step {got} submitted but flow is at step {expected}")]
    InvalidStep { expected: usize, got: usize },

    #[error("No step configured at index {0}")]
    StepConfigNotFound(usize),

    #[error("Flow {0} changed while the step was being processed")]
    StepConflict(Uuid),

    #[error("Flow {0} is not paused")]
    FlowNotPaused(Uuid),

    #[error("Flow {flow_id} cannot move from {from} to {to}")]
    InvalidTransition {
        flow_id: Uuid,
        from: FlowStatus,
        to: FlowStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for AutomationError {
    fn from(e: rusqlite::Error) -> Self {
        AutomationError::Database(DatabaseError::Sqlite(e))
    }
}
