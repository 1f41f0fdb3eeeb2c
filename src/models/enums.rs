use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(AppointmentStatus {
    Planned => "planned",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
    Completed => "completed",
    NoShow => "no_show",
});

str_enum!(FlowStatus {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Cancelled => "cancelled",
});

str_enum!(StepType {
    Message => "message",
    SingleChoice => "single_choice",
    MultipleChoice => "multiple_choice",
    Questionnaire => "questionnaire",
    Document => "document",
});

str_enum!(ConversationStatus {
    Active => "active",
    Archived => "archived",
});

str_enum!(MessageDirection {
    Inbound => "inbound",
    Outbound => "outbound",
});

str_enum!(MessageType {
    Text => "text",
    Interactive => "interactive",
    Button => "button",
    Template => "template",
    Unsupported => "unsupported",
});

str_enum!(UrgencyLevel {
    Critical => "critical",
    Moderate => "moderate",
    Appointment => "appointment",
    Inquiry => "inquiry",
    Low => "low",
});

str_enum!(IntentAction {
    Emergency => "emergency",
    Appointment => "appointment",
    Inquiry => "inquiry",
    Cancellation => "cancellation",
    General => "general",
});

str_enum!(ConfirmationAction {
    Confirm => "confirm",
    Cancel => "cancel",
    Reschedule => "reschedule",
});

str_enum!(AutomationAction {
    FlowCreated => "flow_created",
    StepResponseProcessed => "step_response_processed",
    OptionSelected => "option_selected",
    OptionsSelected => "options_selected",
    QuestionnaireSaved => "questionnaire_saved",
    DocumentProcessed => "document_processed",
    FlowCompleted => "flow_completed",
    FlowPaused => "flow_paused",
    FlowResumed => "flow_resumed",
    FlowCancelled => "flow_cancelled",
    AppointmentStatusChanged => "appointment_status_changed",
    TriageDecision => "triage_decision",
    ConfirmationSent => "confirmation_sent",
    ConfirmationResponse => "confirmation_response",
    MessageSendFailed => "message_send_failed",
});

impl ConfirmationAction {
    /// Appointment status a reply of this kind leads to.
    pub fn target_status(&self) -> AppointmentStatus {
        match self {
            Self::Confirm => AppointmentStatus::Confirmed,
            Self::Cancel => AppointmentStatus::Cancelled,
            Self::Reschedule => AppointmentStatus::Planned,
        }
    }
}

impl AppointmentStatus {
    /// Lenient parse for client-supplied values ("Confirmed", "no-show").
    pub fn parse_loose(raw: &str) -> Result<Self, DatabaseError> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        normalized.parse()
    }
}
