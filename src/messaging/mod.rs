//! WhatsApp messaging: webhook payloads in, patient replies out.

pub mod phone;
pub mod processor;
pub mod transport;
pub mod webhook;

pub use phone::normalize_phone;
pub use processor::{process_message, InboundRequest, ProcessOutcome, RoutedTo};

use thiserror::Error;

use crate::automation::AutomationError;
use crate::confirmation::ConfirmationError;
use crate::conversation::ConversationError;
use crate::core_state::CoreError;
use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Sender is not a usable phone number: {0}")]
    InvalidPhone(String),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Automation(#[from] AutomationError),

    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
