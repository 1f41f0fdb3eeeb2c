//! Which appointments get a reminder, what it says, and how a reply is read.
//!
//! A button payload is authoritative. Typed replies go through a keyword
//! table first; when the keyword match is weak the intent detector decides.

use std::sync::LazyLock;

use chrono::{Duration, NaiveDateTime};
use regex::Regex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::ConfirmationError;
use crate::audit::AuditSink;
use crate::db::{self, DatabaseError};
use crate::models::enums::{AppointmentStatus, AutomationAction, ConfirmationAction, IntentAction};
use crate::models::{Appointment, AutomationLog, ButtonOption, Patient};
use crate::triage::{detect_intent, fold_text, IntentResult};

pub const CONFIRM_VALUE: &str = "confirm";
pub const CANCEL_VALUE: &str = "cancel";

/// Minimum spacing between two reminders for the same appointment.
pub const RESEND_GUARD_HOURS: i64 = 24;

const BUTTON_CONFIDENCE: f32 = 1.0;
const EXACT_KEYWORD_CONFIDENCE: f32 = 0.95;
const SHORT_KEYWORD_CONFIDENCE: f32 = 0.8;
const LONG_KEYWORD_CONFIDENCE: f32 = 0.6;
const CONFLICTING_KEYWORD_CONFIDENCE: f32 = 0.5;
const SHORT_REPLY_WORDS: usize = 4;

/// Checked in this order; each match is blanked out before the next table
/// runs, so "no asistiré" is read as a cancellation only.
static KEYWORD_TABLES: LazyLock<Vec<(ConfirmationAction, Regex)>> = LazyLock::new(|| {
    vec![
        (
            ConfirmationAction::Cancel,
            Regex::new(
                r"\b(?:cancelo|cancelar|cancela|cancel|anulo|anular|no puedo(?: ir| asistir)?|no podre(?: ir| asistir)?|no asistire|no ire|no voy)\b",
            )
            .expect("cancel keywords are valid"),
        ),
        (
            ConfirmationAction::Reschedule,
            Regex::new(r"\b(?:cambiar|cambio|reprogramar|aplazar|mover|otro dia|otra hora|otra fecha)\b")
                .expect("reschedule keywords are valid"),
        ),
        (
            ConfirmationAction::Confirm,
            Regex::new(
                r"\b(?:confirmo|confirmar|confirmada|confirmado|confirm|si|vale|ok|okey|de acuerdo|perfecto|alli estare|asistire)\b",
            )
            .expect("confirm keywords are valid"),
        ),
    ]
});

/// The two quick replies attached to every reminder.
pub fn confirmation_buttons() -> Vec<ButtonOption> {
    vec![
        ButtonOption {
            value: CONFIRM_VALUE.into(),
            label: "Confirmar".into(),
        },
        ButtonOption {
            value: CANCEL_VALUE.into(),
            label: "Cancelar".into(),
        },
    ]
}

/// Appointment status a reply moves to. Reschedule keeps the appointment
/// open for rebooking.
pub fn status_for(action: ConfirmationAction) -> AppointmentStatus {
    match action {
        ConfirmationAction::Confirm => AppointmentStatus::Confirmed,
        ConfirmationAction::Cancel => AppointmentStatus::Cancelled,
        ConfirmationAction::Reschedule => AppointmentStatus::Planned,
    }
}

#[derive(Debug, Clone)]
pub struct DueConfirmation {
    pub appointment: Appointment,
    pub patient: Patient,
}

/// Planned appointments starting within `[now, now + lead_hours]` with no
/// reminder sent in the last [`RESEND_GUARD_HOURS`].
pub fn due_confirmations(
    conn: &Connection,
    now: &NaiveDateTime,
    lead_hours: i64,
) -> Result<Vec<DueConfirmation>, DatabaseError> {
    let until = *now + Duration::hours(lead_hours);
    let guard_since = *now - Duration::hours(RESEND_GUARD_HOURS);

    let mut due = Vec::new();
    for appointment in
        db::list_appointments_between(conn, now, &until, AppointmentStatus::Planned)?
    {
        if db::confirmation_sent_since(conn, &appointment.id, &guard_since)? {
            continue;
        }
        match db::get_patient(conn, &appointment.patient_id)? {
            Some(patient) => due.push(DueConfirmation {
                appointment,
                patient,
            }),
            None => tracing::warn!(
                appointment_id = %appointment.id,
                "Appointment has no patient; skipping confirmation"
            ),
        }
    }
    Ok(due)
}

pub fn render_confirmation_message(
    clinic_name: &str,
    patient: &Patient,
    appointment: &Appointment,
) -> String {
    format!(
        "Hola {}, le recordamos su cita en {} el {} a las {} para {}. ¿Confirma su asistencia?",
        patient.first_name,
        clinic_name,
        appointment.scheduled_at.format("%d/%m/%Y"),
        appointment.scheduled_at.format("%H:%M"),
        appointment.treatment,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Button,
    Keyword,
    Intent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "action", rename_all = "snake_case")]
pub enum ReplyDecision {
    Apply(ConfirmationAction),
    /// Hand over to staff; the appointment is left as is.
    Escalate,
    /// Not a confirmation reply; normal routing continues.
    Unclear,
}

/// How a reply was read. Serialized into the confirmation row for audit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyInterpretation {
    pub decision: ReplyDecision,
    pub confidence: f32,
    pub source: Option<ReplySource>,
    pub keyword: Option<ConfirmationAction>,
    pub keyword_confidence: Option<f32>,
    pub intent: Option<IntentResult>,
}

struct KeywordHit {
    /// `None` when replies for different actions both matched.
    action: Option<ConfirmationAction>,
    confidence: f32,
}

pub fn interpret_reply(
    text: &str,
    button_payload: Option<&str>,
    threshold: f32,
) -> ReplyInterpretation {
    if let Some(action) = button_payload.and_then(action_for_payload) {
        return ReplyInterpretation {
            decision: ReplyDecision::Apply(action),
            confidence: BUTTON_CONFIDENCE,
            source: Some(ReplySource::Button),
            keyword: None,
            keyword_confidence: None,
            intent: None,
        };
    }

    let hit = match_keywords(text);
    let keyword = hit.as_ref().and_then(|h| h.action);
    let keyword_confidence = hit.as_ref().map(|h| h.confidence);

    if let Some(KeywordHit {
        action: Some(action),
        confidence,
    }) = hit
    {
        if confidence >= threshold {
            return ReplyInterpretation {
                decision: ReplyDecision::Apply(action),
                confidence,
                source: Some(ReplySource::Keyword),
                keyword,
                keyword_confidence,
                intent: None,
            };
        }
    }

    let intent = detect_intent(text);
    let (decision, confidence, source) = match intent.action {
        IntentAction::Emergency => (
            ReplyDecision::Escalate,
            intent.heuristic_confidence,
            Some(ReplySource::Intent),
        ),
        IntentAction::Cancellation => (
            ReplyDecision::Apply(ConfirmationAction::Cancel),
            intent.heuristic_confidence,
            Some(ReplySource::Intent),
        ),
        IntentAction::Appointment if keyword_confidence.is_none() => (
            ReplyDecision::Apply(ConfirmationAction::Reschedule),
            intent.heuristic_confidence,
            Some(ReplySource::Intent),
        ),
        _ => match (keyword, keyword_confidence) {
            (Some(action), Some(confidence)) => (
                ReplyDecision::Apply(action),
                confidence,
                Some(ReplySource::Keyword),
            ),
            _ => (ReplyDecision::Unclear, 0.0, None),
        },
    };

    ReplyInterpretation {
        decision,
        confidence,
        source,
        keyword,
        keyword_confidence,
        intent: Some(intent),
    }
}

fn action_for_payload(payload: &str) -> Option<ConfirmationAction> {
    match fold_text(payload.trim()).as_str() {
        "confirm" | "confirmar" | "yes" | "si" => Some(ConfirmationAction::Confirm),
        "cancel" | "cancelar" | "no" => Some(ConfirmationAction::Cancel),
        "reschedule" | "reprogramar" | "cambiar" => Some(ConfirmationAction::Reschedule),
        _ => None,
    }
}

/// Folded text with punctuation replaced by spaces and whitespace collapsed.
fn normalize_reply(text: &str) -> String {
    let folded: String = fold_text(text)
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn match_keywords(text: &str) -> Option<KeywordHit> {
    let normalized = normalize_reply(text);
    if normalized.is_empty() {
        return None;
    }

    let mut remaining = normalized.clone();
    let mut found: Vec<(ConfirmationAction, bool)> = Vec::new();
    for (action, regex) in KEYWORD_TABLES.iter() {
        if let Some(m) = regex.find(&remaining) {
            found.push((*action, m.as_str() == normalized));
            remaining = regex.replace_all(&remaining, " ").into_owned();
        }
    }

    match found.as_slice() {
        [] => None,
        [(action, exact)] => {
            let confidence = if *exact {
                EXACT_KEYWORD_CONFIDENCE
            } else if normalized.split_whitespace().count() <= SHORT_REPLY_WORDS {
                SHORT_KEYWORD_CONFIDENCE
            } else {
                LONG_KEYWORD_CONFIDENCE
            };
            Some(KeywordHit {
                action: Some(*action),
                confidence,
            })
        }
        _ => Some(KeywordHit {
            action: None,
            confidence: CONFLICTING_KEYWORD_CONFIDENCE,
        }),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyOutcome {
    pub confirmation_id: Uuid,
    pub appointment_id: Uuid,
    pub decision: ReplyDecision,
    pub new_status: Option<AppointmentStatus>,
    pub confidence: f32,
    pub acknowledgement: String,
    pub requires_human: bool,
}

/// Apply a patient's reply to the appointment's pending confirmation.
///
/// Returns `None` when nothing is pending, the reply is not a confirmation
/// answer, or another reply was recorded first. The confirmation row and
/// the appointment status are written in one transaction.
pub fn apply_confirmation_reply(
    conn: &Connection,
    audit: &dyn AuditSink,
    appointment_id: &Uuid,
    text: &str,
    button_payload: Option<&str>,
    threshold: f32,
    now: &NaiveDateTime,
) -> Result<Option<ReplyOutcome>, ConfirmationError> {
    let Some(pending) = db::pending_confirmation_for_appointment(conn, appointment_id)? else {
        return Ok(None);
    };

    let interpretation = interpret_reply(text, button_payload, threshold);
    let new_status = match interpretation.decision {
        ReplyDecision::Apply(action) => Some(status_for(action)),
        ReplyDecision::Escalate => None,
        ReplyDecision::Unclear => return Ok(None),
    };
    let classifier_output = serde_json::to_value(&interpretation).unwrap_or_default();

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let appointment = db::get_appointment(&tx, appointment_id)?
        .ok_or(ConfirmationError::AppointmentNotFound(*appointment_id))?;
    let recorded = db::record_confirmation_response(
        &tx,
        &pending.id,
        text,
        now,
        new_status,
        interpretation.confidence,
        &classifier_output,
    )?;
    if !recorded {
        return Ok(None);
    }
    if let Some(status) = new_status {
        db::update_appointment_status(&tx, appointment_id, status, now)?;
    }
    tx.commit()?;

    tracing::info!(
        appointment_id = %appointment_id,
        decision = ?interpretation.decision,
        confidence = interpretation.confidence,
        "Confirmation reply applied"
    );
    audit.record(
        AutomationLog::new(AutomationAction::ConfirmationResponse, *now)
            .appointment(*appointment_id)
            .data(json!({
                "confirmationId": pending.id,
                "previousStatus": appointment.status,
                "finalStatus": new_status,
                "aiConfidence": interpretation.confidence,
                "classifierOutput": classifier_output,
            })),
    );

    Ok(Some(ReplyOutcome {
        confirmation_id: pending.id,
        appointment_id: *appointment_id,
        decision: interpretation.decision,
        new_status,
        confidence: interpretation.confidence,
        acknowledgement: acknowledgement(interpretation.decision, &appointment),
        requires_human: interpretation.decision == ReplyDecision::Escalate,
    }))
}

fn acknowledgement(decision: ReplyDecision, appointment: &Appointment) -> String {
    let when = appointment.scheduled_at.format("%d/%m/%Y %H:%M");
    match decision {
        ReplyDecision::Apply(ConfirmationAction::Confirm) => {
            format!("¡Gracias! Su cita del {when} queda confirmada.")
        }
        ReplyDecision::Apply(ConfirmationAction::Cancel) => format!(
            "Hemos cancelado su cita del {when}. Si desea una nueva cita, escríbanos."
        ),
        ReplyDecision::Apply(ConfirmationAction::Reschedule) => {
            "De acuerdo, le contactaremos para buscar una nueva fecha.".into()
        }
        ReplyDecision::Escalate | ReplyDecision::Unclear => {
            "Hemos recibido su mensaje. Un miembro del equipo le contactará en breve.".into()
        }
    }
}
