//! Reminder dispatch and the periodic confirmation pass.
//!
//! A reminder is reserved (row inserted under the resend guard) before it is
//! sent. A failed delivery releases the reservation so the next pass retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::policy::{
    confirmation_buttons, due_confirmations, render_confirmation_message, DueConfirmation,
    RESEND_GUARD_HOURS,
};
use super::ConfirmationError;
use crate::conversation::mask_phone;
use crate::core_state::CoreState;
use crate::db;
use crate::messaging::transport::OutboundMessage;
use crate::models::enums::{AppointmentStatus, AutomationAction, MessageType};
use crate::models::{AppointmentConfirmation, AutomationLog};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRunSummary {
    pub due: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct Reservation {
    confirmation: AppointmentConfirmation,
    conversation_id: Uuid,
    phone: String,
}

/// One scheduler pass: remind every appointment due within the lead window.
pub async fn run_confirmation_pass(
    state: &CoreState,
    now: NaiveDateTime,
) -> Result<ConfirmationRunSummary, ConfirmationError> {
    let lead_hours = state.config().confirmation_lead_hours;
    let due = {
        let conn = state.open_db()?;
        due_confirmations(&conn, &now, lead_hours)?
    };

    let mut summary = ConfirmationRunSummary {
        due: due.len(),
        ..ConfirmationRunSummary::default()
    };
    for item in &due {
        let reservation = {
            let conn = state.open_db()?;
            reserve(state, &conn, item, &now)
        };
        match reservation {
            Ok(reservation) => match dispatch(state, reservation, &now).await {
                Ok(_) => summary.sent += 1,
                Err(_) => summary.failed += 1,
            },
            Err(ConfirmationError::AlreadySent(_)) => summary.skipped += 1,
            Err(e) => {
                tracing::warn!(appointment_id = %item.appointment.id, error = %e, "Confirmation not reserved");
                summary.failed += 1;
            }
        }
    }

    if summary.due > 0 {
        tracing::info!(
            due = summary.due,
            sent = summary.sent,
            skipped = summary.skipped,
            failed = summary.failed,
            "Confirmation pass finished"
        );
    }
    Ok(summary)
}

/// Remind one appointment now, regardless of the lead window. The resend
/// guard still applies.
pub async fn send_confirmation(
    state: &CoreState,
    appointment_id: &Uuid,
    now: NaiveDateTime,
) -> Result<AppointmentConfirmation, ConfirmationError> {
    let reservation = {
        let conn = state.open_db()?;
        let appointment = db::get_appointment(&conn, appointment_id)?
            .ok_or(ConfirmationError::AppointmentNotFound(*appointment_id))?;
        if appointment.status != AppointmentStatus::Planned {
            return Err(ConfirmationError::NotAwaitingConfirmation {
                appointment_id: *appointment_id,
                status: appointment.status,
            });
        }
        let patient = db::get_patient(&conn, &appointment.patient_id)?
            .ok_or(ConfirmationError::PatientNotFound(appointment.patient_id))?;
        reserve(state, &conn, &DueConfirmation { appointment, patient }, &now)?
    };
    dispatch(state, reservation, &now).await
}

fn reserve(
    state: &CoreState,
    conn: &Connection,
    due: &DueConfirmation,
    now: &NaiveDateTime,
) -> Result<Reservation, ConfirmationError> {
    let phone = due.patient.phone.clone();
    let resolved = state.sessions(conn).resolve_conversation(&phone, *now)?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let guard_since = *now - Duration::hours(RESEND_GUARD_HOURS);
    if db::confirmation_sent_since(&tx, &due.appointment.id, &guard_since)? {
        return Err(ConfirmationError::AlreadySent(due.appointment.id));
    }
    let confirmation = AppointmentConfirmation {
        id: Uuid::new_v4(),
        appointment_id: due.appointment.id,
        conversation_id: Some(resolved.conversation.id),
        message_text: render_confirmation_message(
            &state.config().clinic.name,
            &due.patient,
            &due.appointment,
        ),
        sent_at: *now,
        response_text: None,
        response_date: None,
        final_status: None,
        ai_confidence: None,
        classifier_output: None,
    };
    db::insert_confirmation(&tx, &confirmation)?;
    db::set_conversation_links(
        &tx,
        &resolved.conversation.id,
        Some(&due.patient.id),
        Some(&due.appointment.id),
    )?;
    tx.commit()?;

    Ok(Reservation {
        confirmation,
        conversation_id: resolved.conversation.id,
        phone,
    })
}

async fn dispatch(
    state: &CoreState,
    reservation: Reservation,
    now: &NaiveDateTime,
) -> Result<AppointmentConfirmation, ConfirmationError> {
    let Reservation {
        confirmation,
        conversation_id,
        phone,
    } = reservation;
    let message = OutboundMessage::text(&phone, &confirmation.message_text)
        .with_buttons(&confirmation_buttons());

    match state.transport().send(&message).await {
        Ok(provider_id) => {
            let conn = state.open_db()?;
            state.sessions(&conn).record_outbound(
                conversation_id,
                &confirmation.message_text,
                MessageType::Interactive,
                *now,
            )?;
            tracing::info!(
                appointment_id = %confirmation.appointment_id,
                phone = %mask_phone(&phone),
                "Confirmation sent"
            );
            state.audit().record(
                AutomationLog::new(AutomationAction::ConfirmationSent, *now)
                    .appointment(confirmation.appointment_id)
                    .data(json!({
                        "confirmationId": confirmation.id,
                        "conversationId": conversation_id,
                        "providerMessageId": provider_id,
                    })),
            );
            Ok(confirmation)
        }
        Err(e) => {
            tracing::warn!(
                appointment_id = %confirmation.appointment_id,
                phone = %mask_phone(&phone),
                error = %e,
                "Confirmation delivery failed"
            );
            let conn = state.open_db()?;
            db::delete_unanswered_confirmation(&conn, &confirmation.id)?;
            state.audit().record(
                AutomationLog::new(AutomationAction::MessageSendFailed, *now)
                    .appointment(confirmation.appointment_id)
                    .data(json!({ "confirmationId": confirmation.id, "kind": "confirmation" }))
                    .failed(e.to_string()),
            );
            Err(ConfirmationError::Transport(e))
        }
    }
}

/// Handle for the background confirmation task.
///
/// Dropping the handle requests shutdown; an in-flight pass completes.
pub struct ConfirmationScheduler {
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl ConfirmationScheduler {
    /// Spawn the periodic pass on the current tokio runtime.
    pub fn start(state: Arc<CoreState>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let interval = state.config().confirmation_check_interval;

        let flag = Arc::clone(&shutdown);
        let notify = Arc::clone(&wake);
        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Confirmation scheduler started");
            while !flag.load(Ordering::Relaxed) {
                let now = chrono::Local::now().naive_local();
                if let Err(e) = run_confirmation_pass(&state, now).await {
                    tracing::warn!(error = %e, "Confirmation pass failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = notify.notified() => {}
                }
            }
            tracing::info!("Confirmation scheduler shutting down");
        });

        Self {
            shutdown,
            wake,
            handle: Some(handle),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    /// Request shutdown and wait for the task to exit.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ConfirmationScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
