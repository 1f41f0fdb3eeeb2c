//! Appointment confirmation: reminder selection and dispatch, reply
//! interpretation and the resulting appointment status change.

pub mod policy;
pub mod scheduler;

pub use policy::*;
pub use scheduler::{
    run_confirmation_pass, send_confirmation, ConfirmationRunSummary, ConfirmationScheduler,
};

use thiserror::Error;
use uuid::Uuid;

use crate::conversation::ConversationError;
use crate::core_state::CoreError;
use crate::db::DatabaseError;
use crate::messaging::transport::TransportError;
use crate::models::enums::AppointmentStatus;

#[derive(Error, Debug)]
pub enum ConfirmationError {
    #[error("Appointment not found: {0}")]
    AppointmentNotFound(Uuid),

    #[error("Patient not found: {0}")]
    PatientNotFound(Uuid),

    #[error("Appointment {appointment_id} is {status}, not awaiting confirmation")]
    NotAwaitingConfirmation {
        appointment_id: Uuid,
        status: AppointmentStatus,
    },

    #[error("A confirmation for appointment {0} was already sent in the last 24 hours")]
    AlreadySent(Uuid),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error("Delivery failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for ConfirmationError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}
