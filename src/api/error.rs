//! API error types with structured JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::automation::AutomationError;
use crate::confirmation::ConfirmationError;
use crate::conversation::ConversationError;
use crate::core_state::CoreError;
use crate::db::DatabaseError;
use crate::messaging::MessagingError;

/// Error body: `{ "success": false, "error": ..., "code": ... }`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: &'static str,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    NotFound { code: &'static str, message: String },
    #[error("{message}")]
    Conflict { code: &'static str, message: String },
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },
    #[error("Invalid webhook signature")]
    InvalidSignature,
    #[error("Webhook verification failed")]
    VerificationFailed,
    #[error("Messaging provider error: {0}")]
    Upstream(String),
    #[error("Internal error: {detail}")]
    Internal { code: &'static str, detail: String },
}

impl ApiError {
    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::bad_request("VALIDATION_ERROR", message)
    }

    pub fn database(detail: impl Into<String>) -> Self {
        Self::Internal {
            code: "DATABASE_ERROR",
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::NotFound { code, message } => (StatusCode::NOT_FOUND, *code, message.clone()),
            ApiError::Conflict { code, message } => (StatusCode::CONFLICT, *code, message.clone()),
            ApiError::BadRequest { code, message } => {
                (StatusCode::BAD_REQUEST, *code, message.clone())
            }
            ApiError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                "INVALID_SIGNATURE",
                "Webhook signature does not match".to_string(),
            ),
            ApiError::VerificationFailed => (
                StatusCode::FORBIDDEN,
                "WEBHOOK_VERIFICATION_FAILED",
                "Webhook verification failed".to_string(),
            ),
            ApiError::Upstream(detail) => {
                tracing::warn!(detail, "Messaging provider error");
                (
                    StatusCode::BAD_GATEWAY,
                    "TRANSPORT_ERROR",
                    "The message could not be delivered".to_string(),
                )
            }
            ApiError::Internal { code, detail } => {
                tracing::error!(code, detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    *code,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorBody {
            success: false,
            error: message,
            code,
        };
        (status, Json(body)).into_response()
    }
}

impl From<AutomationError> for ApiError {
    fn from(err: AutomationError) -> Self {
        let message = err.to_string();
        match err {
            AutomationError::AppointmentNotFound(_) => {
                ApiError::not_found("APPOINTMENT_NOT_FOUND", message)
            }
            AutomationError::FlowNotFound(_) => ApiError::not_found("FLOW_NOT_FOUND", message),
            AutomationError::FlowNotFoundOrInactive(_) => {
                ApiError::bad_request("FLOW_NOT_FOUND_OR_INACTIVE", message)
            }
            AutomationError::FlowAlreadyExists { .. } => {
                ApiError::conflict("FLOW_ALREADY_EXISTS", message)
            }
            AutomationError::InvalidFlowConfig(_) => {
                ApiError::bad_request("INVALID_FLOW_CONFIG", message)
            }
            AutomationError::InvalidStep { .. } => ApiError::bad_request("INVALID_STEP", message),
            AutomationError::StepConfigNotFound(_) => {
                ApiError::bad_request("STEP_CONFIG_NOT_FOUND", message)
            }
            AutomationError::StepConflict(_) => ApiError::conflict("STEP_CONFLICT", message),
            AutomationError::FlowNotPaused(_) => ApiError::conflict("FLOW_NOT_PAUSED", message),
            AutomationError::InvalidTransition { .. } => {
                ApiError::conflict("INVALID_FLOW_TRANSITION", message)
            }
            AutomationError::Database(e) => e.into(),
        }
    }
}

impl From<ConfirmationError> for ApiError {
    fn from(err: ConfirmationError) -> Self {
        let message = err.to_string();
        match err {
            ConfirmationError::AppointmentNotFound(_) => {
                ApiError::not_found("APPOINTMENT_NOT_FOUND", message)
            }
            ConfirmationError::PatientNotFound(_) => {
                ApiError::not_found("PATIENT_NOT_FOUND", message)
            }
            ConfirmationError::NotAwaitingConfirmation { .. } => {
                ApiError::conflict("INVALID_APPOINTMENT_STATUS", message)
            }
            ConfirmationError::AlreadySent(_) => {
                ApiError::conflict("CONFIRMATION_ALREADY_SENT", message)
            }
            ConfirmationError::Transport(e) => ApiError::Upstream(e.to_string()),
            ConfirmationError::Conversation(e) => e.into(),
            ConfirmationError::Core(e) => e.into(),
            ConfirmationError::Database(e) => e.into(),
        }
    }
}

impl From<ConversationError> for ApiError {
    fn from(err: ConversationError) -> Self {
        let message = err.to_string();
        match err {
            ConversationError::NotFound(_) => ApiError::not_found("CONVERSATION_NOT_FOUND", message),
            ConversationError::DuplicateMessage(_) => {
                ApiError::conflict("DUPLICATE_MESSAGE", message)
            }
            ConversationError::Database(e) => e.into(),
        }
    }
}

impl From<MessagingError> for ApiError {
    fn from(err: MessagingError) -> Self {
        let message = err.to_string();
        match err {
            MessagingError::InvalidPhone(_) => ApiError::validation(message),
            MessagingError::Conversation(e) => e.into(),
            MessagingError::Automation(e) => e.into(),
            MessagingError::Confirmation(e) => e.into(),
            MessagingError::Core(e) => e.into(),
            MessagingError::Database(e) => e.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Database(e) => e.into(),
            CoreError::Generation(e) => ApiError::Internal {
                code: "GENERATION_ERROR",
                detail: e.to_string(),
            },
            CoreError::Transport(e) => ApiError::Upstream(e.to_string()),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        ApiError::database(err.to_string())
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::database(err.to_string())
    }
}
