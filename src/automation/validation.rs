//! Validation of client-supplied flow definitions into [`FlowConfig`].
//!
//! Accepts either `{"steps": [...]}` or a bare step array. Every problem is
//! collected so the caller sees all of them at once.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::models::enums::AppointmentStatus;
use crate::models::{ButtonOption, FlowConfig, Question, Questionnaire, StepConfig, StepKind};

/// Step as it arrives on the wire: every field optional so validation can
/// report what is missing instead of failing on the first serde error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    #[serde(rename = "type")]
    step_type: Option<String>,
    message: Option<String>,
    buttons: Option<Vec<ButtonOption>>,
    questionnaire: Option<RawQuestionnaire>,
    /// Some clients put questions at step level.
    questions: Option<Vec<Question>>,
    document_id: Option<String>,
    #[serde(default)]
    requires_legal: bool,
    #[serde(default)]
    branches: BTreeMap<String, String>,
    #[serde(alias = "state_change")]
    state_change: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQuestionnaire {
    questions: Option<Vec<Question>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFlowConfig {
    Wrapped { steps: Vec<Value> },
    Bare(Vec<Value>),
}

/// Validate raw JSON into a typed config.
pub fn parse_flow_config(raw: &Value) -> Result<FlowConfig, String> {
    let steps = match serde_json::from_value::<RawFlowConfig>(raw.clone()) {
        Ok(RawFlowConfig::Wrapped { steps }) | Ok(RawFlowConfig::Bare(steps)) => steps,
        Err(_) => return Err("flowConfig must be a list of steps or {\"steps\": [...]}".into()),
    };
    if steps.is_empty() {
        return Err("flowConfig has no steps".into());
    }

    let mut errors = Vec::new();
    let mut validated = Vec::with_capacity(steps.len());
    for (index, value) in steps.into_iter().enumerate() {
        match serde_json::from_value::<RawStep>(value) {
            Ok(raw) => match validate_step(raw) {
                Ok(step) => validated.push(step),
                Err(reason) => errors.push(format!("step {index}: {reason}")),
            },
            Err(e) => errors.push(format!("step {index}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(FlowConfig::new(validated))
    } else {
        Err(errors.join("; "))
    }
}

/// Re-check a typed config. Catches configs built in code rather than parsed.
pub fn check_flow_config(config: &FlowConfig) -> Result<(), String> {
    if config.steps.is_empty() {
        return Err("flowConfig has no steps".into());
    }
    let mut errors = Vec::new();
    for (index, step) in config.steps.iter().enumerate() {
        if step.message.trim().is_empty() {
            errors.push(format!("step {index}: message is required"));
        }
        match &step.kind {
            StepKind::SingleChoice { buttons } | StepKind::MultipleChoice { buttons }
                if buttons.is_empty() =>
            {
                errors.push(format!("step {index}: buttons must not be empty"));
            }
            StepKind::Questionnaire { questionnaire } if questionnaire.questions.is_empty() => {
                errors.push(format!("step {index}: questionnaire has no questions"));
            }
            StepKind::Document { document_id } if document_id.trim().is_empty() => {
                errors.push(format!("step {index}: documentId is required"));
            }
            _ => {}
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

fn validate_step(raw: RawStep) -> Result<StepConfig, String> {
    let step_type = raw
        .step_type
        .filter(|t| !t.trim().is_empty())
        .ok_or("type is required")?;
    let message = raw
        .message
        .filter(|m| !m.trim().is_empty())
        .ok_or("message is required")?;

    let kind = match step_type.as_str() {
        "message" => StepKind::Message,
        "single_choice" | "multiple_choice" => {
            let buttons = raw
                .buttons
                .filter(|b| !b.is_empty())
                .ok_or_else(|| format!("{step_type} requires non-empty buttons"))?;
            if step_type == "single_choice" {
                StepKind::SingleChoice { buttons }
            } else {
                StepKind::MultipleChoice { buttons }
            }
        }
        "questionnaire" => {
            let questions = raw
                .questionnaire
                .and_then(|q| q.questions)
                .or(raw.questions)
                .filter(|q| !q.is_empty())
                .ok_or("questionnaire requires a questions block")?;
            StepKind::Questionnaire {
                questionnaire: Questionnaire { questions },
            }
        }
        "document" => {
            let document_id = raw
                .document_id
                .filter(|d| !d.trim().is_empty())
                .ok_or("document requires documentId")?;
            StepKind::Document { document_id }
        }
        other => return Err(format!("unknown step type '{other}'")),
    };

    let state_change = raw
        .state_change
        .map(|s| {
            AppointmentStatus::parse_loose(&s).map_err(|_| format!("unknown state_change '{s}'"))
        })
        .transpose()?;

    Ok(StepConfig {
        message,
        kind,
        requires_legal: raw.requires_legal,
        branches: raw.branches,
        state_change,
    })
}
