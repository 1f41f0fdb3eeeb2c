//! Inbound patient message handling.
//!
//! Every message is persisted with its triage annotations, then routed to
//! exactly one handler in precedence order: critical escalation, the
//! patient's active flow, a pending confirmation, AI reply (outside
//! staffed hours), staff. Pending work is looked up by patient and
//! conversation, so a session opened before the appointment existed still
//! reaches it. Replies are recorded on the conversation and
//! handed to the transport on a spawned task.

use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::phone::normalize_phone;
use super::transport::OutboundMessage;
use super::MessagingError;
use crate::automation::{submission_from_chat, AutomationError, RequestMeta, StepOutcome};
use crate::confirmation::apply_confirmation_reply;
use crate::conversation::{mask_phone, should_activate_ai, ConversationError, InboundMessage};
use crate::core_state::CoreState;
use crate::db;
use crate::models::enums::{AutomationAction, MessageType};
use crate::models::{
    AiMetadata, AutomationFlow, AutomationLog, ButtonOption, Conversation, StepConfig,
};
use crate::triage::{
    classify_urgency, detect_intent, should_auto_respond, IntentResult, PatientContext,
    ResponseSource, UrgencyAssessment,
};

/// Sent when the last step of a flow has been answered.
const FLOW_COMPLETED_TEXT: &str = "¡Gracias! Hemos completado el proceso. Le esperamos en su cita.";

/// Prefix for re-asking a step whose answer could not be used.
const STEP_RETRY_TEXT: &str = "No hemos podido registrar su respuesta.";

#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Sender as received; normalized before use.
    pub phone: String,
    pub text: String,
    pub button_payload: Option<String>,
    pub external_id: Option<String>,
    pub message_type: MessageType,
    pub received_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutedTo {
    Flow,
    Confirmation,
    Ai,
    Staff,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub success: bool,
    /// The provider id was already recorded; nothing else was done.
    pub duplicate: bool,
    pub conversation_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    pub ai_processed: bool,
    pub routed_to: Option<RoutedTo>,
    pub response: Option<String>,
    pub requires_human: bool,
    pub urgency: UrgencyAssessment,
    pub intent: IntentResult,
}

/// What to do once the inbound message is stored.
enum Plan {
    Reply {
        text: String,
        buttons: Vec<ButtonOption>,
        routed_to: RoutedTo,
        requires_human: bool,
    },
    Generate {
        patient: PatientContext,
    },
    Silent {
        routed_to: RoutedTo,
    },
}

struct Routed {
    conversation: Conversation,
    message_id: Uuid,
    plan: Plan,
    /// Appointment whose flow or confirmation took the message.
    appointment_id: Option<Uuid>,
}

pub async fn process_message(
    state: &CoreState,
    inbound: InboundRequest,
) -> Result<ProcessOutcome, MessagingError> {
    let config = state.config();
    let phone = normalize_phone(&inbound.phone, &config.default_country_code)
        .ok_or_else(|| MessagingError::InvalidPhone(mask_phone(&inbound.phone)))?;
    let urgency = classify_urgency(&inbound.text);
    let intent = detect_intent(&inbound.text);
    let at = inbound.received_at;

    let routed = {
        let conn = state.open_db()?;
        store_and_route(state, &conn, &phone, &inbound, &urgency, &intent)?
    };
    let Some(Routed {
        conversation,
        message_id,
        plan,
        appointment_id,
    }) = routed
    else {
        tracing::info!(phone = %mask_phone(&phone), "Duplicate inbound message ignored");
        return Ok(ProcessOutcome {
            success: true,
            duplicate: true,
            conversation_id: None,
            message_id: None,
            ai_processed: false,
            routed_to: None,
            response: None,
            requires_human: false,
            urgency,
            intent,
        });
    };

    let (reply, buttons, routed_to, requires_human, ai_processed) = match plan {
        Plan::Reply {
            text,
            buttons,
            routed_to,
            requires_human,
        } => (Some(text), buttons, routed_to, requires_human, false),
        Plan::Generate { patient } => {
            let generated = state
                .generator()
                .respond(&inbound.text, &urgency, &intent, &patient)
                .await;
            let ai_processed = generated.source == ResponseSource::Generated;
            (
                Some(generated.text),
                Vec::new(),
                RoutedTo::Ai,
                generated.requires_human,
                ai_processed,
            )
        }
        Plan::Silent { routed_to } => (None, Vec::new(), routed_to, true, false),
    };

    if let Some(text) = &reply {
        let message_type = if buttons.is_empty() {
            MessageType::Text
        } else {
            MessageType::Interactive
        };
        {
            let conn = state.open_db()?;
            state
                .sessions(&conn)
                .record_outbound(conversation.id, text, message_type, at)?;
        }
        dispatch(
            state,
            OutboundMessage::text(&phone, text).with_buttons(&buttons),
            conversation.id,
            at,
        );
    }

    let mut decision = AutomationLog::new(AutomationAction::TriageDecision, at).data(json!({
        "conversationId": conversation.id,
        "messageId": message_id,
        "urgencyLevel": urgency.level,
        "urgencyScore": urgency.score,
        "intent": intent.action,
        "heuristicConfidence": intent.heuristic_confidence,
        "routedTo": routed_to,
        "aiProcessed": ai_processed,
        "requiresHuman": requires_human,
        "replied": reply.is_some(),
    }));
    if let Some(appointment_id) = appointment_id.or(conversation.appointment_id) {
        decision = decision.appointment(appointment_id);
    }
    state.audit().record(decision);

    tracing::info!(
        conversation_id = %conversation.id,
        urgency = %urgency.level,
        intent = %intent.action,
        routed_to = ?routed_to,
        ai_processed,
        "Inbound message processed"
    );

    Ok(ProcessOutcome {
        success: true,
        duplicate: false,
        conversation_id: Some(conversation.id),
        message_id: Some(message_id),
        ai_processed,
        routed_to: Some(routed_to),
        response: reply,
        requires_human,
        urgency,
        intent,
    })
}

/// Persist the inbound message and decide the route. `None` for a
/// provider retry of a message already stored.
fn store_and_route(
    state: &CoreState,
    conn: &Connection,
    phone: &str,
    inbound: &InboundRequest,
    urgency: &UrgencyAssessment,
    intent: &IntentResult,
) -> Result<Option<Routed>, MessagingError> {
    if let Some(external_id) = &inbound.external_id {
        if db::message_exists_by_external_id(conn, external_id)? {
            return Ok(None);
        }
    }

    let sessions = state.sessions(conn);
    let conversation = sessions
        .resolve_conversation(phone, inbound.received_at)?
        .conversation;
    let metadata = AiMetadata {
        confidence: intent.heuristic_confidence,
        intent: intent.action,
        urgency_level: urgency.level,
    };
    let stored = sessions.record_inbound(
        conversation.id,
        &InboundMessage {
            text: &inbound.text,
            message_type: inbound.message_type,
            external_id: inbound.external_id.as_deref(),
            received_at: inbound.received_at,
        },
        Some(metadata),
    );
    let message = match stored {
        Ok(message) => message,
        Err(ConversationError::DuplicateMessage(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let (plan, appointment_id) = route(state, conn, &conversation, inbound, urgency)?;
    if let Some(appointment_id) = appointment_id {
        if conversation.appointment_id != Some(appointment_id) {
            db::set_conversation_links(conn, &conversation.id, None, Some(&appointment_id))?;
        }
    }
    Ok(Some(Routed {
        conversation,
        message_id: message.id,
        plan,
        appointment_id,
    }))
}

fn route(
    state: &CoreState,
    conn: &Connection,
    conversation: &Conversation,
    inbound: &InboundRequest,
    urgency: &UrgencyAssessment,
) -> Result<(Plan, Option<Uuid>), MessagingError> {
    let config = state.config();
    let at = &inbound.received_at;
    let ai_hours = should_activate_ai(config, at);
    let auto_respond = should_auto_respond(&config.ai, urgency);

    if urgency.is_critical() {
        state.sessions(conn).mark_urgent(conversation.id)?;
        tracing::warn!(
            conversation_id = %conversation.id,
            score = urgency.score,
            "Critical inbound message"
        );
        let plan = if !auto_respond {
            Plan::Silent {
                routed_to: RoutedTo::Staff,
            }
        } else if ai_hours {
            Plan::Generate {
                patient: patient_context(conn, conversation)?,
            }
        } else {
            Plan::Reply {
                text: state.generator().emergency_template().text,
                buttons: Vec::new(),
                routed_to: RoutedTo::Staff,
                requires_human: true,
            }
        };
        return Ok((plan, None));
    }

    if let Some(flow) = active_flow(conn, conversation)? {
        let appointment_id = flow.appointment_id;
        if let Some(plan) = route_to_flow(state, conn, flow, inbound)? {
            return Ok((plan, Some(appointment_id)));
        }
    }

    let pending = db::pending_confirmation_for_conversation(
        conn,
        &conversation.id,
        conversation.patient_id.as_ref(),
    )?;
    if let Some(pending) = pending {
        let reply = apply_confirmation_reply(
            conn,
            state.audit(),
            &pending.appointment_id,
            &inbound.text,
            inbound.button_payload.as_deref(),
            config.ai.confidence_threshold,
            at,
        )?;
        if let Some(outcome) = reply {
            let plan = Plan::Reply {
                text: outcome.acknowledgement,
                buttons: Vec::new(),
                routed_to: RoutedTo::Confirmation,
                requires_human: outcome.requires_human,
            };
            return Ok((plan, Some(pending.appointment_id)));
        }
    }

    let plan = if ai_hours && auto_respond {
        Plan::Generate {
            patient: patient_context(conn, conversation)?,
        }
    } else {
        Plan::Silent {
            routed_to: RoutedTo::Staff,
        }
    };
    Ok((plan, None))
}

/// The patient's active flow; the linked appointment's when the sender is
/// not a known patient.
fn active_flow(
    conn: &Connection,
    conversation: &Conversation,
) -> Result<Option<AutomationFlow>, MessagingError> {
    let flow = match (conversation.patient_id, conversation.appointment_id) {
        (Some(patient_id), _) => db::find_active_flow_for_patient(conn, &patient_id)?,
        (None, Some(appointment_id)) => db::find_active_flow_for_appointment(conn, &appointment_id)?,
        (None, None) => None,
    };
    Ok(flow)
}

/// Feed the message to an active flow at its current step.
fn route_to_flow(
    state: &CoreState,
    conn: &Connection,
    flow: AutomationFlow,
    inbound: &InboundRequest,
) -> Result<Option<Plan>, MessagingError> {
    let Some(step) = flow.current_step().cloned() else {
        return Ok(None);
    };
    let appointment_id = flow.appointment_id;

    let submission = submission_from_chat(&step, &inbound.text, inbound.button_payload.as_deref());
    let result = state.flow_engine(conn).submit_step_response(
        &flow.id,
        flow.current_step_index,
        &submission,
        &RequestMeta::default(),
        &inbound.received_at,
    );
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(
            e @ (AutomationError::StepConflict(_)
            | AutomationError::InvalidStep { .. }
            | AutomationError::FlowNotFoundOrInactive(_)),
        ) => {
            tracing::warn!(flow_id = %flow.id, error = %e, "Flow moved underneath chat reply");
            return Ok(Some(Plan::Silent {
                routed_to: RoutedTo::Flow,
            }));
        }
        Err(e) => return Err(e.into()),
    };

    for status in &outcome.next_states {
        let previous = db::get_appointment(conn, &appointment_id)?.map(|a| a.status);
        db::update_appointment_status(conn, &appointment_id, *status, &inbound.received_at)?;
        tracing::info!(
            appointment_id = %appointment_id,
            status = %status,
            flow_id = %flow.id,
            "Appointment status set by flow"
        );
        state.audit().record(
            AutomationLog::new(AutomationAction::AppointmentStatusChanged, inbound.received_at)
                .flow(flow.id)
                .appointment(appointment_id)
                .data(json!({
                    "previousStatus": previous,
                    "newStatus": status,
                    "stepIndex": outcome.step_index,
                })),
        );
    }

    let (text, buttons) = flow_reply(&outcome, &step);
    Ok(Some(Plan::Reply {
        text,
        buttons,
        routed_to: RoutedTo::Flow,
        requires_human: false,
    }))
}

/// Acknowledge the answer and present whatever the flow asks next. A
/// failed answer that did not move the pointer re-asks the same step.
fn flow_reply(
    outcome: &StepOutcome,
    answered: &StepConfig,
) -> (String, Vec<ButtonOption>) {
    let halted = !outcome.processed && outcome.current_step_index == outcome.step_index;
    if halted {
        return (
            format!("{STEP_RETRY_TEXT}\n\n{}", answered.message),
            answered.kind.buttons().to_vec(),
        );
    }

    let mut parts = Vec::new();
    if outcome.processed {
        if let Some(ack) = &outcome.acknowledgement {
            parts.push(ack.clone());
        }
    }
    let mut buttons = Vec::new();
    match &outcome.next_step {
        Some(next) => {
            parts.push(next.message.clone());
            buttons = next.kind.buttons().to_vec();
        }
        None if outcome.completed() => parts.push(FLOW_COMPLETED_TEXT.to_string()),
        None => {}
    }
    (parts.join("\n\n"), buttons)
}

fn patient_context(
    conn: &Connection,
    conversation: &Conversation,
) -> Result<PatientContext, MessagingError> {
    let name = match conversation.patient_id {
        Some(id) => db::get_patient(conn, &id)?.map(|p| p.first_name),
        None => None,
    };
    let next_appointment = match conversation.appointment_id {
        Some(id) => db::get_appointment(conn, &id)?.map(|a| a.scheduled_at),
        None => None,
    };
    Ok(PatientContext {
        name,
        next_appointment,
    })
}

/// Fire-and-forget delivery. Failures are logged and audited, never retried.
fn dispatch(state: &CoreState, message: OutboundMessage, conversation_id: Uuid, at: NaiveDateTime) {
    let transport = state.transport();
    let audit = state.audit_handle();
    tokio::spawn(async move {
        if let Err(e) = transport.send(&message).await {
            tracing::warn!(
                conversation_id = %conversation_id,
                phone = %mask_phone(&message.to),
                error = %e,
                "Reply delivery failed"
            );
            audit.record(
                AutomationLog::new(AutomationAction::MessageSendFailed, at)
                    .data(json!({ "conversationId": conversation_id }))
                    .failed(e.to_string()),
            );
        }
    });
}
