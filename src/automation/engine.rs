//! Flow engine: creation, strict in-order step submission and lifecycle.
//!
//! Every write runs in an `IMMEDIATE` transaction. Step side effects run
//! inside a savepoint so a failed step leaves no partial rows behind, and
//! the pointer only moves through a compare-and-swap on the flow version.
//! Audit entries go to the [`AuditSink`] after commit.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{validation, AutomationError};
use crate::audit::AuditSink;
use crate::config::StepFailurePolicy;
use crate::db;
use crate::models::enums::{AppointmentStatus, AutomationAction, FlowStatus, StepType};
use crate::models::{
    Appointment, AutomationFlow, AutomationLog, ButtonOption, FlowConfig, LegalDocument, Patient,
    QuestionnaireResponse, StepConfig, StepKind,
};
use crate::triage::fold_text;

/// A patient's answer to one step.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSubmission {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub selected_options: Option<Vec<String>>,
    #[serde(default)]
    pub free_text: Option<String>,
    #[serde(default, alias = "questionnaireResponses")]
    pub questionnaire_answers: Option<Value>,
}

impl StepSubmission {
    fn options(&self) -> &[String] {
        self.selected_options.as_deref().unwrap_or(&[])
    }
}

/// Where a submission came from; captured on legal acceptance.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub flow_id: Uuid,
    pub step_index: usize,
    pub step_type: StepType,
    pub processed: bool,
    pub error: Option<String>,
    pub acknowledgement: Option<String>,
    pub selected_options: Vec<String>,
    /// Follow-up flow referenced by the chosen option. Recorded, not followed.
    pub branch_target: Option<String>,
    /// Appointment transitions for the caller to apply.
    pub next_states: Vec<AppointmentStatus>,
    pub current_step_index: usize,
    pub flow_status: FlowStatus,
    pub next_step: Option<StepConfig>,
}

impl StepOutcome {
    pub fn completed(&self) -> bool {
        self.flow_status == FlowStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDetail {
    pub flow: AutomationFlow,
    pub appointment: Option<Appointment>,
    pub patient: Option<Patient>,
    pub logs: Vec<AutomationLog>,
    pub legal_documents: Vec<LegalDocument>,
    pub questionnaire_responses: Vec<QuestionnaireResponse>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveFlowSummary {
    pub flow: AutomationFlow,
    pub appointment: Option<Appointment>,
    pub patient: Option<Patient>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    pub total: i64,
    pub by_status: BTreeMap<FlowStatus, i64>,
    pub log_successes: i64,
    pub log_failures: i64,
}

/// Side effects of a successfully processed step, audited after commit.
struct StepEffect {
    acknowledgement: String,
    selected: Vec<String>,
    branch_target: Option<String>,
    logs: Vec<AutomationLog>,
}

pub struct FlowEngine<'a> {
    conn: &'a Connection,
    audit: &'a dyn AuditSink,
    policy: StepFailurePolicy,
}

impl<'a> FlowEngine<'a> {
    pub fn new(conn: &'a Connection, audit: &'a dyn AuditSink, policy: StepFailurePolicy) -> Self {
        Self { conn, audit, policy }
    }

    /// Create a flow from client JSON. Checks run in order: appointment,
    /// existing active flow, config validity. Nothing is written on failure.
    pub fn create_flow(
        &self,
        appointment_id: &Uuid,
        flow_type: &str,
        raw_config: &Value,
        now: &NaiveDateTime,
    ) -> Result<AutomationFlow, AutomationError> {
        self.create(appointment_id, flow_type, now, || {
            validation::parse_flow_config(raw_config)
        })
    }

    pub fn create_flow_with_config(
        &self,
        appointment_id: &Uuid,
        flow_type: &str,
        config: FlowConfig,
        now: &NaiveDateTime,
    ) -> Result<AutomationFlow, AutomationError> {
        self.create(appointment_id, flow_type, now, move || {
            validation::check_flow_config(&config).map(|()| config)
        })
    }

    fn create(
        &self,
        appointment_id: &Uuid,
        flow_type: &str,
        now: &NaiveDateTime,
        resolve_config: impl FnOnce() -> Result<FlowConfig, String>,
    ) -> Result<AutomationFlow, AutomationError> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;

        if db::get_appointment(&tx, appointment_id)?.is_none() {
            return Err(AutomationError::AppointmentNotFound(*appointment_id));
        }
        if let Some(existing) = db::find_active_flow_for_appointment(&tx, appointment_id)? {
            return Err(AutomationError::FlowAlreadyExists {
                appointment_id: *appointment_id,
                flow_id: existing.id,
            });
        }
        let config = resolve_config().map_err(AutomationError::InvalidFlowConfig)?;

        let flow = AutomationFlow {
            id: Uuid::new_v4(),
            appointment_id: *appointment_id,
            flow_type: flow_type.to_string(),
            config,
            current_step_index: 0,
            status: FlowStatus::Active,
            version: 0,
            created_at: *now,
            updated_at: *now,
        };
        db::insert_flow(&tx, &flow)?;
        tx.commit()?;

        tracing::info!(flow_id = %flow.id, flow_type, steps = flow.step_count(), "Flow created");
        self.audit.record(
            AutomationLog::new(AutomationAction::FlowCreated, *now)
                .flow(flow.id)
                .appointment(flow.appointment_id)
                .data(json!({ "flowType": flow.flow_type, "stepCount": flow.step_count() })),
        );
        Ok(flow)
    }

    /// Process the response to step `step_index`, which must be the flow's
    /// current step.
    pub fn submit_step_response(
        &self,
        flow_id: &Uuid,
        step_index: usize,
        submission: &StepSubmission,
        meta: &RequestMeta,
        now: &NaiveDateTime,
    ) -> Result<StepOutcome, AutomationError> {
        let mut tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;

        let flow = db::get_flow(&tx, flow_id)?
            .filter(|f| f.status == FlowStatus::Active)
            .ok_or(AutomationError::FlowNotFoundOrInactive(*flow_id))?;
        if step_index != flow.current_step_index {
            return Err(AutomationError::InvalidStep {
                expected: flow.current_step_index,
                got: step_index,
            });
        }
        let step = flow
            .current_step()
            .cloned()
            .ok_or(AutomationError::StepConfigNotFound(step_index))?;
        let appointment = db::get_appointment(&tx, &flow.appointment_id)?
            .ok_or(AutomationError::AppointmentNotFound(flow.appointment_id))?;

        let result = {
            let sp = tx.savepoint()?;
            match apply_step(&sp, &flow, &appointment, &step, submission, meta, now) {
                Ok(effect) => {
                    sp.commit()?;
                    Ok(effect)
                }
                // Dropping the savepoint rolls back any partial writes.
                Err(reason) => Err(reason),
            }
        };

        let advance = result.is_ok() || self.policy == StepFailurePolicy::Advance;
        let (new_index, new_status) = if advance {
            let next = step_index + 1;
            let status = if next >= flow.step_count() {
                FlowStatus::Completed
            } else {
                FlowStatus::Active
            };
            (next, status)
        } else {
            (step_index, FlowStatus::Active)
        };

        if advance
            && !db::advance_flow(
                &tx,
                flow_id,
                step_index,
                flow.version,
                new_index,
                new_status,
                now,
            )?
        {
            return Err(AutomationError::StepConflict(*flow_id));
        }
        tx.commit()?;

        let step_type = step.kind.step_type();
        let next_states: Vec<AppointmentStatus> = match &result {
            Ok(_) => step.state_change.into_iter().collect(),
            Err(_) => Vec::new(),
        };

        let mut processed_log = AutomationLog::new(AutomationAction::StepResponseProcessed, *now)
            .flow(flow.id)
            .appointment(flow.appointment_id);
        let outcome = match result {
            Ok(effect) => {
                tracing::info!(flow_id = %flow.id, step = step_index, %step_type, "Step processed");
                processed_log = processed_log.data(json!({
                    "stepIndex": step_index,
                    "stepType": step_type,
                    "selectedOptions": effect.selected,
                    "branchTarget": effect.branch_target,
                    "nextStates": next_states,
                    "newIndex": new_index,
                    "newStatus": new_status,
                }));
                for log in effect.logs {
                    self.audit.record(log);
                }
                StepOutcome {
                    flow_id: flow.id,
                    step_index,
                    step_type,
                    processed: true,
                    error: None,
                    acknowledgement: Some(effect.acknowledgement),
                    selected_options: effect.selected,
                    branch_target: effect.branch_target,
                    next_states,
                    current_step_index: new_index,
                    flow_status: new_status,
                    next_step: None,
                }
            }
            Err(reason) => {
                tracing::warn!(
                    flow_id = %flow.id,
                    step = step_index,
                    %step_type,
                    advanced = advance,
                    error = %reason,
                    "Step processing failed"
                );
                processed_log = processed_log
                    .data(json!({
                        "stepIndex": step_index,
                        "stepType": step_type,
                        "newIndex": new_index,
                        "newStatus": new_status,
                    }))
                    .failed(reason.clone());
                StepOutcome {
                    flow_id: flow.id,
                    step_index,
                    step_type,
                    processed: false,
                    error: Some(reason),
                    acknowledgement: None,
                    selected_options: Vec::new(),
                    branch_target: None,
                    next_states,
                    current_step_index: new_index,
                    flow_status: new_status,
                    next_step: None,
                }
            }
        };
        self.audit.record(processed_log);

        if new_status == FlowStatus::Completed {
            tracing::info!(flow_id = %flow.id, "Flow completed");
            self.audit.record(
                AutomationLog::new(AutomationAction::FlowCompleted, *now)
                    .flow(flow.id)
                    .appointment(flow.appointment_id)
                    .data(json!({ "stepCount": flow.step_count() })),
            );
        }

        let next_step = match new_status {
            FlowStatus::Active => flow.config.steps.get(new_index).cloned(),
            _ => None,
        };
        Ok(StepOutcome { next_step, ..outcome })
    }

    pub fn pause_flow(
        &self,
        flow_id: &Uuid,
        now: &NaiveDateTime,
    ) -> Result<AutomationFlow, AutomationError> {
        self.transition(flow_id, FlowStatus::Paused, now)
    }

    pub fn resume_flow(
        &self,
        flow_id: &Uuid,
        now: &NaiveDateTime,
    ) -> Result<AutomationFlow, AutomationError> {
        self.transition(flow_id, FlowStatus::Active, now)
    }

    /// Soft cancel; flows are never deleted.
    pub fn cancel_flow(
        &self,
        flow_id: &Uuid,
        now: &NaiveDateTime,
    ) -> Result<AutomationFlow, AutomationError> {
        self.transition(flow_id, FlowStatus::Cancelled, now)
    }

    fn transition(
        &self,
        flow_id: &Uuid,
        target: FlowStatus,
        now: &NaiveDateTime,
    ) -> Result<AutomationFlow, AutomationError> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let flow = db::get_flow(&tx, flow_id)?.ok_or(AutomationError::FlowNotFound(*flow_id))?;

        let action = match (flow.status, target) {
            // Repeated pause or cancel is a no-op.
            (FlowStatus::Paused, FlowStatus::Paused)
            | (FlowStatus::Cancelled, FlowStatus::Cancelled) => return Ok(flow),
            (FlowStatus::Active, FlowStatus::Paused) => AutomationAction::FlowPaused,
            (FlowStatus::Active | FlowStatus::Paused, FlowStatus::Cancelled) => {
                AutomationAction::FlowCancelled
            }
            (FlowStatus::Paused, FlowStatus::Active) => {
                if let Some(other) = db::find_active_flow_for_appointment(&tx, &flow.appointment_id)? {
                    return Err(AutomationError::FlowAlreadyExists {
                        appointment_id: flow.appointment_id,
                        flow_id: other.id,
                    });
                }
                AutomationAction::FlowResumed
            }
            (_, FlowStatus::Active) => return Err(AutomationError::FlowNotPaused(*flow_id)),
            (from, to) => {
                return Err(AutomationError::InvalidTransition {
                    flow_id: *flow_id,
                    from,
                    to,
                })
            }
        };

        db::set_flow_status(&tx, flow_id, target, now)?;
        let updated = db::get_flow(&tx, flow_id)?.ok_or(AutomationError::FlowNotFound(*flow_id))?;
        tx.commit()?;

        tracing::info!(flow_id = %flow_id, from = %flow.status, to = %target, "Flow status changed");
        self.audit.record(
            AutomationLog::new(action, *now)
                .flow(updated.id)
                .appointment(updated.appointment_id)
                .data(json!({ "from": flow.status, "to": target })),
        );
        Ok(updated)
    }

    /// Flow with its appointment, patient, audit trail and captured records.
    pub fn get_flow_detail(&self, flow_id: &Uuid) -> Result<FlowDetail, AutomationError> {
        let flow = db::get_flow(self.conn, flow_id)?.ok_or(AutomationError::FlowNotFound(*flow_id))?;
        let (appointment, patient) = self.appointment_and_patient(&flow.appointment_id)?;
        Ok(FlowDetail {
            logs: db::get_logs_for_flow(self.conn, flow_id)?,
            legal_documents: db::get_legal_documents_for_flow(self.conn, flow_id)?,
            questionnaire_responses: db::get_questionnaire_responses_for_flow(self.conn, flow_id)?,
            flow,
            appointment,
            patient,
        })
    }

    pub fn active_flows(&self) -> Result<Vec<ActiveFlowSummary>, AutomationError> {
        db::list_flows_by_status(self.conn, FlowStatus::Active)?
            .into_iter()
            .map(|flow| {
                let (appointment, patient) = self.appointment_and_patient(&flow.appointment_id)?;
                Ok(ActiveFlowSummary {
                    flow,
                    appointment,
                    patient,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> Result<FlowStats, AutomationError> {
        let mut by_status: BTreeMap<FlowStatus, i64> = [
            FlowStatus::Active,
            FlowStatus::Paused,
            FlowStatus::Completed,
            FlowStatus::Cancelled,
        ]
        .into_iter()
        .map(|s| (s, 0))
        .collect();
        by_status.extend(db::count_flows_by_status(self.conn)?);
        let (log_successes, log_failures) = db::count_log_outcomes(self.conn)?;

        Ok(FlowStats {
            total: by_status.values().sum(),
            by_status,
            log_successes,
            log_failures,
        })
    }

    fn appointment_and_patient(
        &self,
        appointment_id: &Uuid,
    ) -> Result<(Option<Appointment>, Option<Patient>), AutomationError> {
        let appointment = db::get_appointment(self.conn, appointment_id)?;
        let patient = match &appointment {
            Some(appt) => db::get_patient(self.conn, &appt.patient_id)?,
            None => None,
        };
        Ok((appointment, patient))
    }
}

/// Run the step-specific side effects. Any error is reported back as a
/// processing failure, never raised past the engine.
fn apply_step(
    conn: &Connection,
    flow: &AutomationFlow,
    appointment: &Appointment,
    step: &StepConfig,
    submission: &StepSubmission,
    meta: &RequestMeta,
    now: &NaiveDateTime,
) -> Result<StepEffect, String> {
    let log = |action: AutomationAction, data: Value| {
        AutomationLog::new(action, *now)
            .flow(flow.id)
            .appointment(flow.appointment_id)
            .data(data)
    };

    match &step.kind {
        StepKind::Message => Ok(StepEffect {
            acknowledgement: "Mensaje recibido.".into(),
            selected: Vec::new(),
            branch_target: None,
            logs: Vec::new(),
        }),

        StepKind::SingleChoice { buttons } => {
            let raw = submission
                .options()
                .first()
                .or(submission.response.as_ref())
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .ok_or("no option selected")?;
            let option =
                match_option(buttons, raw).ok_or_else(|| format!("unknown option '{raw}'"))?;
            let branch_target = step.branches.get(&option.value).cloned();
            Ok(StepEffect {
                acknowledgement: format!("Ha seleccionado: {}", option.label),
                selected: vec![option.value.clone()],
                logs: vec![log(
                    AutomationAction::OptionSelected,
                    json!({ "option": option.value, "branchTarget": branch_target }),
                )],
                branch_target,
            })
        }

        StepKind::MultipleChoice { buttons } => {
            let raw: Vec<&str> = if submission.options().is_empty() {
                submission
                    .response
                    .as_deref()
                    .map(|r| r.split(',').collect())
                    .unwrap_or_default()
            } else {
                submission.options().iter().map(String::as_str).collect()
            };
            let mut chosen: Vec<&ButtonOption> = Vec::new();
            for value in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
                let option =
                    match_option(buttons, value).ok_or_else(|| format!("unknown option '{value}'"))?;
                if !chosen.iter().any(|c| c.value == option.value) {
                    chosen.push(option);
                }
            }
            if chosen.is_empty() {
                return Err("no options selected".into());
            }
            let selected: Vec<String> = chosen.iter().map(|o| o.value.clone()).collect();
            let branch_target = selected.iter().find_map(|v| step.branches.get(v).cloned());
            let labels: Vec<&str> = chosen.iter().map(|o| o.label.as_str()).collect();
            Ok(StepEffect {
                acknowledgement: format!("Ha seleccionado: {}", labels.join(", ")),
                logs: vec![log(
                    AutomationAction::OptionsSelected,
                    json!({ "options": selected, "branchTarget": branch_target }),
                )],
                selected,
                branch_target,
            })
        }

        StepKind::Questionnaire { questionnaire } => {
            let answers = submission
                .questionnaire_answers
                .as_ref()
                .filter(|a| !a.is_null())
                .ok_or("questionnaire answers are required")?;
            if let Some(map) = answers.as_object() {
                let missing: Vec<&str> = questionnaire
                    .questions
                    .iter()
                    .filter(|q| q.required && !is_answered(map.get(&q.id)))
                    .map(|q| q.id.as_str())
                    .collect();
                if !missing.is_empty() {
                    return Err(format!("missing required answers: {}", missing.join(", ")));
                }
            }

            let record = QuestionnaireResponse {
                id: Uuid::new_v4(),
                patient_id: appointment.patient_id,
                appointment_id: Some(appointment.id),
                flow_id: Some(flow.id),
                questionnaire: serde_json::to_value(questionnaire).map_err(|e| e.to_string())?,
                responses: answers.clone(),
                lopd_accepted: step.requires_legal,
                created_at: *now,
            };
            db::insert_questionnaire_response(conn, &record).map_err(|e| e.to_string())?;
            Ok(StepEffect {
                acknowledgement: "Gracias, hemos registrado sus respuestas.".into(),
                selected: Vec::new(),
                branch_target: None,
                logs: vec![log(
                    AutomationAction::QuestionnaireSaved,
                    json!({ "responseId": record.id, "lopdAccepted": record.lopd_accepted }),
                )],
            })
        }

        StepKind::Document { document_id } => {
            let accepted = submission.response.as_deref() == Some("accept");
            let mut legal_id = None;
            if step.requires_legal {
                let doc = LegalDocument {
                    id: Uuid::new_v4(),
                    patient_id: appointment.patient_id,
                    appointment_id: Some(appointment.id),
                    flow_id: Some(flow.id),
                    document_ref: document_id.clone(),
                    accepted,
                    accepted_at: accepted.then_some(*now),
                    ip_address: meta.ip_address.clone().filter(|_| accepted),
                    user_agent: meta.user_agent.clone().filter(|_| accepted),
                    created_at: *now,
                };
                db::insert_legal_document(conn, &doc).map_err(|e| e.to_string())?;
                legal_id = Some(doc.id);
            }
            let acknowledgement = if accepted {
                "Documento aceptado."
            } else {
                "Documento registrado."
            };
            Ok(StepEffect {
                acknowledgement: acknowledgement.into(),
                selected: Vec::new(),
                branch_target: None,
                logs: vec![log(
                    AutomationAction::DocumentProcessed,
                    json!({
                        "documentId": document_id,
                        "accepted": accepted,
                        "legalDocumentId": legal_id,
                    }),
                )],
            })
        }
    }
}

fn match_option<'b>(buttons: &'b [ButtonOption], raw: &str) -> Option<&'b ButtonOption> {
    buttons
        .iter()
        .find(|b| b.value == raw)
        .or_else(|| buttons.iter().find(|b| b.label.eq_ignore_ascii_case(raw)))
}

fn is_answered(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(_) => true,
    }
}

/// Words a patient types to accept a document over chat.
const CHAT_ACCEPT_WORDS: &[&str] = &["acepto", "aceptar", "accept", "si", "de acuerdo", "ok"];

/// Translate a chat reply (typed text or button payload) into a step
/// submission for the flow's current step.
pub fn submission_from_chat(
    step: &StepConfig,
    text: &str,
    button_payload: Option<&str>,
) -> StepSubmission {
    let reply = button_payload.unwrap_or(text).trim();
    let base = StepSubmission {
        response: Some(reply.to_string()),
        free_text: Some(text.to_string()),
        ..StepSubmission::default()
    };

    match &step.kind {
        StepKind::Message => base,
        StepKind::SingleChoice { buttons } => StepSubmission {
            selected_options: chat_option(buttons, reply).map(|v| vec![v]),
            ..base
        },
        StepKind::MultipleChoice { buttons } => {
            let selected: Option<Vec<String>> = reply
                .split(',')
                .map(|part| chat_option(buttons, part.trim()))
                .collect();
            StepSubmission {
                selected_options: selected,
                ..base
            }
        }
        StepKind::Questionnaire { questionnaire } => {
            let answers = match questionnaire.questions.as_slice() {
                [only] => {
                    let mut map = serde_json::Map::new();
                    map.insert(only.id.clone(), Value::String(text.to_string()));
                    Value::Object(map)
                }
                _ => json!({ "freeText": text }),
            };
            StepSubmission {
                questionnaire_answers: Some(answers),
                ..base
            }
        }
        StepKind::Document { .. } => {
            let folded = fold_text(reply);
            let accepted = CHAT_ACCEPT_WORDS.contains(&folded.trim_end_matches('.'));
            StepSubmission {
                response: Some(if accepted { "accept".into() } else { reply.to_string() }),
                ..base
            }
        }
    }
}

/// Option value for a chat reply: exact value, 1-based number, or folded label.
fn chat_option(buttons: &[ButtonOption], reply: &str) -> Option<String> {
    if let Some(b) = buttons.iter().find(|b| b.value == reply) {
        return Some(b.value.clone());
    }
    if let Ok(n) = reply.parse::<usize>() {
        return n.checked_sub(1).and_then(|i| buttons.get(i)).map(|b| b.value.clone());
    }
    let folded = fold_text(reply);
    buttons
        .iter()
        .find(|b| fold_text(&b.label) == folded || fold_text(&b.value) == folded)
        .map(|b| b.value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::db::repository::fixtures::*;
    use crate::db::open_memory_database;
    use crate::models::enums::AppointmentStatus;
    use crate::models::{Question, Questionnaire};

    fn now() -> NaiveDateTime {
        ts(2026, 3, 10, 21, 0)
    }

    fn setup() -> (Connection, Appointment) {
        let conn = open_memory_database().unwrap();
        let patient = seed_patient(&conn, "34600111222");
        let appt = seed_appointment(&conn, &patient.id, ts(2026, 3, 11, 10, 0), AppointmentStatus::Planned);
        (conn, appt)
    }

    fn step(kind: StepKind, requires_legal: bool) -> StepConfig {
        StepConfig {
            message: "Paso".into(),
            kind,
            requires_legal,
            branches: BTreeMap::new(),
            state_change: None,
        }
    }

    fn questionnaire_config() -> FlowConfig {
        FlowConfig::new(vec![
            step(
                StepKind::Questionnaire {
                    questionnaire: Questionnaire {
                        questions: vec![Question {
                            id: "allergies".into(),
                            text: "¿Tiene alergias?".into(),
                            required: true,
                        }],
                    },
                },
                true,
            ),
            step(StepKind::Message, false),
        ])
    }

    fn choice(value: &str) -> StepSubmission {
        StepSubmission {
            selected_options: Some(vec![value.into()]),
            ..StepSubmission::default()
        }
    }

    #[test]
    fn create_flow_starts_at_first_step() {
        let (conn, appt) = setup();
        let audit = MemoryAuditSink::new();
        let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Advance);

        let flow = engine
            .create_flow(
                &appt.id,
                "pre_visit",
                &json!({"steps": [{"type": "message", "message": "Hola"}]}),
                &now(),
            )
            .unwrap();
        assert_eq!(flow.current_step_index, 0);
        assert_eq!(flow.status, FlowStatus::Active);

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action_type, AutomationAction::FlowCreated);
        assert_eq!(entries[0].flow_id, Some(flow.id));
    }

    #[test]
    fn create_flow_rejections_persist_nothing() {
        let (conn, appt) = setup();
        let audit = MemoryAuditSink::new();
        let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Advance);
        let valid = json!([{"type": "message", "message": "Hola"}]);

        let missing = Uuid::new_v4();
        assert!(matches!(
            engine.create_flow(&missing, "pre_visit", &valid, &now()),
            Err(AutomationError::AppointmentNotFound(id)) if id == missing
        ));
        assert!(matches!(
            engine.create_flow(&appt.id, "pre_visit", &json!([{"type": "carousel"}]), &now()),
            Err(AutomationError::InvalidFlowConfig(_))
        ));
        assert!(db::find_active_flow_for_appointment(&conn, &appt.id).unwrap().is_none());

        let first = engine.create_flow(&appt.id, "pre_visit", &valid, &now()).unwrap();
        match engine.create_flow(&appt.id, "pre_visit", &valid, &now()) {
            Err(AutomationError::FlowAlreadyExists { flow_id, .. }) => assert_eq!(flow_id, first.id),
            other => panic!("expected FlowAlreadyExists, got {other:?}"),
        }
    }

    #[test]
    fn steps_progress_to_completion() {
        let (conn, appt) = setup();
        let audit = MemoryAuditSink::new();
        let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Advance);
        let flow = engine
            .create_flow_with_config(&appt.id, "confirmation", two_step_config(), &now())
            .unwrap();

        let first = engine
            .submit_step_response(&flow.id, 0, &StepSubmission::default(), &RequestMeta::default(), &now())
            .unwrap();
        assert!(first.processed);
        assert_eq!(first.current_step_index, 1);
        assert_eq!(first.flow_status, FlowStatus::Active);
        assert_eq!(first.next_step.as_ref().map(|s| s.kind.step_type()), Some(StepType::SingleChoice));

        let second = engine
            .submit_step_response(&flow.id, 1, &choice("confirm"), &RequestMeta::default(), &now())
            .unwrap();
        assert!(second.processed);
        assert!(second.completed());
        assert_eq!(second.selected_options, vec!["confirm".to_string()]);
        assert_eq!(second.next_states, vec![AppointmentStatus::Confirmed]);
        assert_eq!(second.acknowledgement.as_deref(), Some("Ha seleccionado: Confirmar"));
        assert!(second.next_step.is_none());

        let stored = db::get_flow(&conn, &flow.id).unwrap().unwrap();
        assert_eq!(stored.status, FlowStatus::Completed);
        assert_eq!(stored.current_step_index, 2);

        // The engine never touches the appointment itself.
        let appt = db::get_appointment(&conn, &appt.id).unwrap().unwrap();
        assert_eq!(appt.status, AppointmentStatus::Planned);

        let actions: Vec<AutomationAction> = audit.entries().iter().map(|e| e.action_type).collect();
        assert!(actions.contains(&AutomationAction::OptionSelected));
        assert_eq!(actions.last(), Some(&AutomationAction::FlowCompleted));

        assert!(matches!(
            engine.submit_step_response(&flow.id, 2, &choice("confirm"), &RequestMeta::default(), &now()),
            Err(AutomationError::FlowNotFoundOrInactive(_))
        ));
    }

    #[test]
    fn out_of_order_and_replayed_steps_rejected() {
        let (conn, appt) = setup();
        let audit = MemoryAuditSink::new();
        let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Advance);
        let flow = seed_flow(&conn, &appt.id, two_step_config());
        let meta = RequestMeta::default();

        assert!(matches!(
            engine.submit_step_response(&flow.id, 1, &choice("confirm"), &meta, &now()),
            Err(AutomationError::InvalidStep { expected: 0, got: 1 })
        ));
        engine
            .submit_step_response(&flow.id, 0, &StepSubmission::default(), &meta, &now())
            .unwrap();
        assert!(matches!(
            engine.submit_step_response(&flow.id, 0, &StepSubmission::default(), &meta, &now()),
            Err(AutomationError::InvalidStep { expected: 1, got: 0 })
        ));
        assert!(matches!(
            engine.submit_step_response(&Uuid::new_v4(), 0, &StepSubmission::default(), &meta, &now()),
            Err(AutomationError::FlowNotFoundOrInactive(_))
        ));
    }

    #[test]
    fn failed_step_advances_under_advance_policy() {
        let (conn, appt) = setup();
        let audit = MemoryAuditSink::new();
        let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Advance);
        let flow = seed_flow(&conn, &appt.id, questionnaire_config());

        let outcome = engine
            .submit_step_response(&flow.id, 0, &StepSubmission::default(), &RequestMeta::default(), &now())
            .unwrap();
        assert!(!outcome.processed);
        assert_eq!(outcome.error.as_deref(), Some("questionnaire answers are required"));
        assert_eq!(outcome.current_step_index, 1);
        assert!(db::get_questionnaire_responses_for_flow(&conn, &flow.id).unwrap().is_empty());

        let processed = audit
            .entries()
            .into_iter()
            .find(|e| e.action_type == AutomationAction::StepResponseProcessed)
            .unwrap();
        assert!(!processed.success);
    }

    #[test]
    fn failed_step_holds_pointer_under_halt_policy() {
        let (conn, appt) = setup();
        let audit = MemoryAuditSink::new();
        let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Halt);
        let flow = seed_flow(&conn, &appt.id, questionnaire_config());

        let partial = StepSubmission {
            questionnaire_answers: Some(json!({"allergies": ""})),
            ..StepSubmission::default()
        };
        let outcome = engine
            .submit_step_response(&flow.id, 0, &partial, &RequestMeta::default(), &now())
            .unwrap();
        assert!(!outcome.processed);
        assert_eq!(outcome.error.as_deref(), Some("missing required answers: allergies"));
        assert_eq!(outcome.current_step_index, 0);
        assert_eq!(db::get_flow(&conn, &flow.id).unwrap().unwrap().current_step_index, 0);

        let answered = StepSubmission {
            questionnaire_answers: Some(json!({"allergies": "penicilina"})),
            ..StepSubmission::default()
        };
        let outcome = engine
            .submit_step_response(&flow.id, 0, &answered, &RequestMeta::default(), &now())
            .unwrap();
        assert!(outcome.processed);
        let saved = db::get_questionnaire_responses_for_flow(&conn, &flow.id).unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].lopd_accepted);
        assert_eq!(saved[0].responses["allergies"], "penicilina");
    }

    #[test]
    fn document_step_records_legal_acceptance() {
        let (conn, appt) = setup();
        let audit = MemoryAuditSink::new();
        let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Advance);
        let document = |id: &str| step(StepKind::Document { document_id: id.into() }, true);
        let flow = seed_flow(&conn, &appt.id, FlowConfig::new(vec![document("lopd"), document("consent")]));
        let meta = RequestMeta {
            ip_address: Some("203.0.113.7".into()),
            user_agent: Some("test-agent".into()),
        };

        let accept = StepSubmission {
            response: Some("accept".into()),
            ..StepSubmission::default()
        };
        engine.submit_step_response(&flow.id, 0, &accept, &meta, &now()).unwrap();
        let decline = StepSubmission {
            response: Some("decline".into()),
            ..StepSubmission::default()
        };
        let outcome = engine.submit_step_response(&flow.id, 1, &decline, &meta, &now()).unwrap();
        assert_eq!(outcome.acknowledgement.as_deref(), Some("Documento registrado."));

        let docs = db::get_legal_documents_for_flow(&conn, &flow.id).unwrap();
        assert_eq!(docs.len(), 2);
        let lopd = docs.iter().find(|d| d.document_ref == "lopd").unwrap();
        assert!(lopd.accepted);
        assert_eq!(lopd.accepted_at, Some(now()));
        assert_eq!(lopd.ip_address.as_deref(), Some("203.0.113.7"));
        let consent = docs.iter().find(|d| d.document_ref == "consent").unwrap();
        assert!(!consent.accepted);
        assert!(consent.ip_address.is_none());
    }

    #[test]
    fn choice_branches_are_recorded_not_followed() {
        let (conn, appt) = setup();
        let audit = MemoryAuditSink::new();
        let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Advance);
        let mut config = two_step_config();
        config.steps[1].branches.insert("cancel".into(), "reschedule_flow".into());
        let buttons = config.steps[1].kind.buttons().to_vec();
        config.steps.insert(
            0,
            step(StepKind::MultipleChoice { buttons }, false),
        );
        let flow = seed_flow(&conn, &appt.id, config);
        let meta = RequestMeta::default();

        let multi = StepSubmission {
            response: Some("confirm, cancel".into()),
            ..StepSubmission::default()
        };
        let outcome = engine.submit_step_response(&flow.id, 0, &multi, &meta, &now()).unwrap();
        assert_eq!(outcome.selected_options, vec!["confirm".to_string(), "cancel".to_string()]);

        engine
            .submit_step_response(&flow.id, 1, &StepSubmission::default(), &meta, &now())
            .unwrap();
        let outcome = engine.submit_step_response(&flow.id, 2, &choice("Cancelar"), &meta, &now()).unwrap();
        assert_eq!(outcome.branch_target.as_deref(), Some("reschedule_flow"));
        assert!(outcome.completed());
    }

    #[test]
    fn lifecycle_transitions_are_guarded() {
        let (conn, appt) = setup();
        let audit = MemoryAuditSink::new();
        let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Advance);
        let flow = seed_flow(&conn, &appt.id, two_step_config());
        let meta = RequestMeta::default();

        assert!(matches!(
            engine.resume_flow(&flow.id, &now()),
            Err(AutomationError::FlowNotPaused(_))
        ));
        assert_eq!(engine.pause_flow(&flow.id, &now()).unwrap().status, FlowStatus::Paused);
        assert!(matches!(
            engine.submit_step_response(&flow.id, 0, &StepSubmission::default(), &meta, &now()),
            Err(AutomationError::FlowNotFoundOrInactive(_))
        ));

        // A new flow may start while the old one is paused; the old one then
        // cannot be resumed alongside it.
        let replacement = seed_flow(&conn, &appt.id, two_step_config());
        assert!(matches!(
            engine.resume_flow(&flow.id, &now()),
            Err(AutomationError::FlowAlreadyExists { flow_id, .. }) if flow_id == replacement.id
        ));
        engine.cancel_flow(&replacement.id, &now()).unwrap();
        assert_eq!(engine.resume_flow(&flow.id, &now()).unwrap().status, FlowStatus::Active);

        let cancelled = engine.cancel_flow(&flow.id, &now()).unwrap();
        assert_eq!(cancelled.status, FlowStatus::Cancelled);
        assert_eq!(engine.cancel_flow(&flow.id, &now()).unwrap().status, FlowStatus::Cancelled);
        assert!(matches!(
            engine.pause_flow(&flow.id, &now()),
            Err(AutomationError::InvalidTransition { from: FlowStatus::Cancelled, .. })
        ));
        assert!(matches!(
            engine.pause_flow(&Uuid::new_v4(), &now()),
            Err(AutomationError::FlowNotFound(_))
        ));
    }

    #[test]
    fn stats_and_active_flows() {
        let (conn, appt) = setup();
        let audit = MemoryAuditSink::new();
        let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Advance);
        let active = seed_flow(&conn, &appt.id, two_step_config());
        let other_patient = seed_patient(&conn, "34600999888");
        let other = seed_appointment(&conn, &other_patient.id, ts(2026, 3, 12, 9, 0), AppointmentStatus::Planned);
        let paused = seed_flow(&conn, &other.id, two_step_config());
        engine.pause_flow(&paused.id, &now()).unwrap();

        let stats = engine.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status[&FlowStatus::Active], 1);
        assert_eq!(stats.by_status[&FlowStatus::Paused], 1);
        assert_eq!(stats.by_status[&FlowStatus::Completed], 0);

        let summaries = engine.active_flows().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].flow.id, active.id);
        assert_eq!(summaries[0].patient.as_ref().map(|p| p.phone.as_str()), Some("34600111222"));

        let detail = engine.get_flow_detail(&paused.id).unwrap();
        assert_eq!(detail.appointment.map(|a| a.id), Some(other.id));
    }

    #[test]
    fn chat_replies_map_to_submissions() {
        let config = two_step_config();
        let choice_step = &config.steps[1];
        for reply in ["confirm", "1", "confirmar", "CONFIRMAR"] {
            let submission = submission_from_chat(choice_step, reply, None);
            assert_eq!(submission.selected_options, Some(vec!["confirm".to_string()]), "{reply}");
        }
        let by_button = submission_from_chat(choice_step, "Cancelar", Some("cancel"));
        assert_eq!(by_button.selected_options, Some(vec!["cancel".to_string()]));
        assert!(submission_from_chat(choice_step, "hola", None).selected_options.is_none());

        let document = step(StepKind::Document { document_id: "lopd".into() }, true);
        assert_eq!(submission_from_chat(&document, "Sí", None).response.as_deref(), Some("accept"));
        assert_eq!(submission_from_chat(&document, "no", None).response.as_deref(), Some("no"));

        let questionnaire = &questionnaire_config().steps[0];
        let submission = submission_from_chat(questionnaire, "Ninguna", None);
        assert_eq!(submission.questionnaire_answers, Some(json!({"allergies": "Ninguna"})));
    }

    #[test]
    fn concurrent_submitters_record_one_legal_document() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let database = db::Database::initialize(&dir.path().join("race.db")).unwrap();
        let flow = {
            let conn = database.connect().unwrap();
            let patient = seed_patient(&conn, "34600111222");
            let appt = seed_appointment(&conn, &patient.id, ts(2026, 3, 11, 10, 0), AppointmentStatus::Planned);
            let document = step(StepKind::Document { document_id: "lopd".into() }, true);
            seed_flow(&conn, &appt.id, FlowConfig::new(vec![document, step(StepKind::Message, false)]))
        };
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let database = database.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let conn = database.connect().unwrap();
                    let audit = MemoryAuditSink::new();
                    let engine = FlowEngine::new(&conn, &audit, StepFailurePolicy::Advance);
                    let accept = StepSubmission {
                        response: Some("accept".into()),
                        ..StepSubmission::default()
                    };
                    barrier.wait();
                    engine.submit_step_response(&flow.id, 0, &accept, &RequestMeta::default(), &now())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| matches!(r, Ok(o) if o.processed)).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(AutomationError::InvalidStep { expected: 1, got: 0 } | AutomationError::StepConflict(_))
        )));

        let conn = database.connect().unwrap();
        assert_eq!(db::get_legal_documents_for_flow(&conn, &flow.id).unwrap().len(), 1);
        assert_eq!(db::get_flow(&conn, &flow.id).unwrap().unwrap().current_step_index, 1);
    }
}
