use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{AppointmentStatus, AutomationAction, FlowStatus, StepType};

/// Current on-disk version of [`FlowConfig`].
pub const FLOW_CONFIG_VERSION: u32 = 1;

/// A quick-reply option offered by a choice step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonOption {
    #[serde(alias = "id")]
    pub value: String,
    #[serde(alias = "title", alias = "text")]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(alias = "question", alias = "label")]
    pub text: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Questionnaire {
    pub questions: Vec<Question>,
}

/// What a step expects back from the patient. Closed set; every consumer
/// matches exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Message,
    SingleChoice {
        buttons: Vec<ButtonOption>,
    },
    MultipleChoice {
        buttons: Vec<ButtonOption>,
    },
    Questionnaire {
        questionnaire: Questionnaire,
    },
    Document {
        #[serde(rename = "documentId")]
        document_id: String,
    },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Message => StepType::Message,
            StepKind::SingleChoice { .. } => StepType::SingleChoice,
            StepKind::MultipleChoice { .. } => StepType::MultipleChoice,
            StepKind::Questionnaire { .. } => StepType::Questionnaire,
            StepKind::Document { .. } => StepType::Document,
        }
    }

    pub fn buttons(&self) -> &[ButtonOption] {
        match self {
            StepKind::SingleChoice { buttons } | StepKind::MultipleChoice { buttons } => buttons,
            _ => &[],
        }
    }
}

/// One validated step. Immutable once the flow is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    pub message: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub requires_legal: bool,
    /// option value → referenced follow-up flow. Recorded, never jumped to.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branches: BTreeMap<String, String>,
    #[serde(
        default,
        rename = "state_change",
        skip_serializing_if = "Option::is_none"
    )]
    pub state_change: Option<AppointmentStatus>,
}

/// Versioned step list persisted in `automation_flows.flow_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub version: u32,
    pub steps: Vec<StepConfig>,
}

impl FlowConfig {
    pub fn new(steps: Vec<StepConfig>) -> Self {
        Self {
            version: FLOW_CONFIG_VERSION,
            steps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationFlow {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub flow_type: String,
    pub config: FlowConfig,
    pub current_step_index: usize,
    pub status: FlowStatus,
    /// Bumped on every write; step submission compares-and-swaps on it.
    pub version: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl AutomationFlow {
    pub fn current_step(&self) -> Option<&StepConfig> {
        self.config.steps.get(self.current_step_index)
    }

    pub fn step_count(&self) -> usize {
        self.config.steps.len()
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationLog {
    pub id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub flow_id: Option<Uuid>,
    pub action_type: AutomationAction,
    pub action_data: serde_json::Value,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}

impl AutomationLog {
    pub fn new(action_type: AutomationAction, created_at: NaiveDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            appointment_id: None,
            flow_id: None,
            action_type,
            action_data: serde_json::Value::Object(Default::default()),
            success: true,
            error_message: None,
            created_at,
        }
    }

    pub fn flow(mut self, flow_id: Uuid) -> Self {
        self.flow_id = Some(flow_id);
        self
    }

    pub fn appointment(mut self, appointment_id: Uuid) -> Self {
        self.appointment_id = Some(appointment_id);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.action_data = data;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error.into());
        self
    }
}
