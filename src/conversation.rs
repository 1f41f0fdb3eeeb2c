//! WhatsApp conversation sessions.
//!
//! A phone number's messages are grouped into sessions: an inbound message
//! continues the most recent conversation when it arrives within the
//! conversation window of its last activity, otherwise a new conversation
//! is opened. Old conversations are left untouched.

use chrono::{Duration, NaiveDateTime};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ClinicConfig;
use crate::db::{repository, DatabaseError};
use crate::models::enums::{ConversationStatus, MessageDirection, MessageType};
use crate::models::{AiMetadata, Conversation, Message, URGENT_COLOR_TAG};

#[derive(Error, Debug)]
pub enum ConversationError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Conversation not found: {0}")]
    NotFound(Uuid),

    #[error("Message {0} was already recorded")]
    DuplicateMessage(String),
}

impl From<rusqlite::Error> for ConversationError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConversation {
    pub conversation: Conversation,
    /// True when this message opened a new session.
    pub created: bool,
}

/// An inbound message as received from the provider.
#[derive(Debug, Clone)]
pub struct InboundMessage<'m> {
    pub text: &'m str,
    pub message_type: MessageType,
    pub external_id: Option<&'m str>,
    pub received_at: NaiveDateTime,
}

/// True iff AI replies are enabled and `at` falls outside staffed hours.
/// During working hours patients are answered by staff.
pub fn should_activate_ai(config: &ClinicConfig, at: &NaiveDateTime) -> bool {
    config.ai.enabled && !config.working_hours.contains(at)
}

/// Maps phone numbers to conversations and persists their messages.
pub struct SessionManager<'a> {
    conn: &'a Connection,
    window: Duration,
}

impl<'a> SessionManager<'a> {
    pub fn new(conn: &'a Connection, window: Duration) -> Self {
        Self { conn, window }
    }

    /// Find or open the conversation for `phone` at `at`.
    ///
    /// Lookup and insert run in one IMMEDIATE transaction, so two racing
    /// messages from the same number serialize on the write lock and the
    /// second one sees the conversation created by the first.
    pub fn resolve_conversation(
        &self,
        phone: &str,
        at: NaiveDateTime,
    ) -> Result<ResolvedConversation, ConversationError> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;

        let existing = repository::latest_conversation_for_phone(&tx, phone)?;
        let resolved = match existing {
            Some(mut conversation) if at - conversation.last_activity_at < self.window => {
                repository::touch_conversation(&tx, &conversation.id, &at)?;
                if at > conversation.last_activity_at {
                    conversation.last_activity_at = at;
                }
                // A patient or appointment registered after the session opened.
                if conversation.patient_id.is_none() || conversation.appointment_id.is_none() {
                    link_patient(&tx, &mut conversation, &at)?;
                }
                ResolvedConversation {
                    conversation,
                    created: false,
                }
            }
            _ => {
                let mut conversation = Conversation {
                    id: Uuid::new_v4(),
                    phone_number: phone.to_string(),
                    patient_id: None,
                    appointment_id: None,
                    status: ConversationStatus::Active,
                    color_tag: None,
                    last_activity_at: at,
                    created_at: at,
                };
                repository::insert_conversation(&tx, &conversation)?;
                link_patient(&tx, &mut conversation, &at)?;
                tracing::info!(
                    conversation_id = %conversation.id,
                    phone = %mask_phone(phone),
                    "Opened conversation"
                );
                ResolvedConversation {
                    conversation,
                    created: true,
                }
            }
        };

        tx.commit()?;
        Ok(resolved)
    }

    /// Persist an inbound message and bump the conversation's activity.
    pub fn record_inbound(
        &self,
        conversation_id: Uuid,
        inbound: &InboundMessage<'_>,
        ai_metadata: Option<AiMetadata>,
    ) -> Result<Message, ConversationError> {
        if let Some(external_id) = inbound.external_id {
            if repository::message_exists_by_external_id(self.conn, external_id)? {
                return Err(ConversationError::DuplicateMessage(external_id.to_string()));
            }
        }
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            direction: MessageDirection::Inbound,
            text: inbound.text.to_string(),
            message_type: inbound.message_type,
            external_id: inbound.external_id.map(str::to_string),
            sent_at: inbound.received_at,
            is_read: false,
            ai_metadata,
        };
        self.store(&message)?;
        Ok(message)
    }

    /// Persist an outbound message and bump the conversation's activity.
    pub fn record_outbound(
        &self,
        conversation_id: Uuid,
        text: &str,
        message_type: MessageType,
        at: NaiveDateTime,
    ) -> Result<Message, ConversationError> {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            direction: MessageDirection::Outbound,
            text: text.to_string(),
            message_type,
            external_id: None,
            sent_at: at,
            is_read: true,
            ai_metadata: None,
        };
        self.store(&message)?;
        Ok(message)
    }

    pub fn mark_urgent(&self, conversation_id: Uuid) -> Result<(), ConversationError> {
        repository::set_conversation_color_tag(self.conn, &conversation_id, Some(URGENT_COLOR_TAG))?;
        Ok(())
    }

    pub fn history(&self, conversation_id: Uuid) -> Result<Vec<Message>, ConversationError> {
        self.ensure_conversation_exists(conversation_id)?;
        Ok(repository::get_messages_by_conversation(self.conn, &conversation_id)?)
    }

    fn store(&self, message: &Message) -> Result<(), ConversationError> {
        self.ensure_conversation_exists(message.conversation_id)?;
        repository::insert_message(self.conn, message).map_err(|e| {
            // Unique index on provider ids catches a concurrent duplicate.
            let constraint = matches!(
                &e,
                DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(f, _))
                    if f.code == rusqlite::ErrorCode::ConstraintViolation
            );
            match &message.external_id {
                Some(external_id) if constraint => {
                    ConversationError::DuplicateMessage(external_id.clone())
                }
                _ => ConversationError::Database(e),
            }
        })?;
        repository::touch_conversation(self.conn, &message.conversation_id, &message.sent_at)?;
        Ok(())
    }

    fn ensure_conversation_exists(&self, id: Uuid) -> Result<(), ConversationError> {
        if repository::get_conversation(self.conn, &id)?.is_none() {
            return Err(ConversationError::NotFound(id));
        }
        Ok(())
    }
}

/// Attach the patient registered under this phone and their next appointment.
fn link_patient(
    conn: &Connection,
    conversation: &mut Conversation,
    at: &NaiveDateTime,
) -> Result<(), DatabaseError> {
    let Some(patient) = repository::find_patient_by_phone(conn, &conversation.phone_number)? else {
        return Ok(());
    };
    let appointment = repository::next_appointment_for_patient(conn, &patient.id, at)?;
    let appointment_id = appointment.map(|a| a.id);
    repository::set_conversation_links(conn, &conversation.id, Some(&patient.id), appointment_id.as_ref())?;
    conversation.patient_id = Some(patient.id);
    if appointment_id.is_some() {
        conversation.appointment_id = appointment_id;
    }
    Ok(())
}

/// Last four digits only, for logs.
pub fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::fixtures::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::enums::{AppointmentStatus, IntentAction, UrgencyLevel};

    const PHONE: &str = "34600111222";

    fn manager(conn: &Connection) -> SessionManager<'_> {
        SessionManager::new(conn, Duration::hours(24))
    }

    #[test]
    fn first_message_opens_conversation() {
        let conn = open_memory_database().unwrap();
        let resolved = manager(&conn).resolve_conversation(PHONE, ts(2026, 3, 1, 9, 0)).unwrap();
        assert!(resolved.created);
        assert_eq!(resolved.conversation.phone_number, PHONE);
        assert_eq!(resolved.conversation.last_activity_at, ts(2026, 3, 1, 9, 0));
    }

    #[test]
    fn message_within_window_reuses_conversation() {
        let conn = open_memory_database().unwrap();
        let sessions = manager(&conn);
        let first = sessions.resolve_conversation(PHONE, ts(2026, 3, 1, 9, 0)).unwrap();
        let second = sessions.resolve_conversation(PHONE, ts(2026, 3, 2, 8, 59)).unwrap();
        assert!(!second.created);
        assert_eq!(second.conversation.id, first.conversation.id);
        assert_eq!(second.conversation.last_activity_at, ts(2026, 3, 2, 8, 59));
    }

    #[test]
    fn message_after_window_opens_new_conversation() {
        let conn = open_memory_database().unwrap();
        let sessions = manager(&conn);
        let first = sessions.resolve_conversation(PHONE, ts(2026, 3, 1, 9, 0)).unwrap();
        let second = sessions.resolve_conversation(PHONE, ts(2026, 3, 2, 9, 1)).unwrap();
        assert!(second.created);
        assert_ne!(second.conversation.id, first.conversation.id);

        // The old conversation is left as it was.
        let old = repository::get_conversation(&conn, &first.conversation.id).unwrap().unwrap();
        assert_eq!(old.last_activity_at, ts(2026, 3, 1, 9, 0));
        assert_eq!(old.status, ConversationStatus::Active);
    }

    #[test]
    fn exactly_window_apart_opens_new_conversation() {
        let conn = open_memory_database().unwrap();
        let sessions = manager(&conn);
        let first = sessions.resolve_conversation(PHONE, ts(2026, 3, 1, 9, 0)).unwrap();
        let second = sessions.resolve_conversation(PHONE, ts(2026, 3, 2, 9, 0)).unwrap();
        assert_ne!(second.conversation.id, first.conversation.id);
    }

    #[test]
    fn outbound_message_extends_window() {
        let conn = open_memory_database().unwrap();
        let sessions = manager(&conn);
        let first = sessions.resolve_conversation(PHONE, ts(2026, 3, 1, 9, 0)).unwrap();
        sessions
            .record_outbound(first.conversation.id, "Recordatorio", MessageType::Text, ts(2026, 3, 1, 20, 0))
            .unwrap();
        let next = sessions.resolve_conversation(PHONE, ts(2026, 3, 2, 19, 0)).unwrap();
        assert_eq!(next.conversation.id, first.conversation.id);
    }

    #[test]
    fn new_conversation_links_patient_and_next_appointment() {
        let conn = open_memory_database().unwrap();
        let patient = seed_patient(&conn, PHONE);
        let appt = seed_appointment(&conn, &patient.id, ts(2026, 3, 3, 10, 0), AppointmentStatus::Planned);

        let resolved = manager(&conn).resolve_conversation(PHONE, ts(2026, 3, 1, 9, 0)).unwrap();
        assert_eq!(resolved.conversation.patient_id, Some(patient.id));
        assert_eq!(resolved.conversation.appointment_id, Some(appt.id));

        let stored = repository::get_conversation(&conn, &resolved.conversation.id).unwrap().unwrap();
        assert_eq!(stored.appointment_id, Some(appt.id));
    }

    #[test]
    fn reused_conversation_links_appointment_booked_later() {
        let conn = open_memory_database().unwrap();
        let patient = seed_patient(&conn, PHONE);
        let sessions = manager(&conn);
        let first = sessions.resolve_conversation(PHONE, ts(2026, 3, 10, 9, 0)).unwrap();
        assert_eq!(first.conversation.appointment_id, None);

        let appt = seed_appointment(&conn, &patient.id, ts(2026, 3, 11, 9, 0), AppointmentStatus::Planned);
        let again = sessions.resolve_conversation(PHONE, ts(2026, 3, 10, 11, 0)).unwrap();
        assert_eq!(again.conversation.id, first.conversation.id);
        assert_eq!(again.conversation.appointment_id, Some(appt.id));
    }

    #[test]
    fn concurrent_resolution_opens_one_conversation() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let database = crate::db::Database::initialize(&dir.path().join("race.db")).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let database = database.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let conn = database.connect().unwrap();
                    barrier.wait();
                    manager(&conn)
                        .resolve_conversation(PHONE, ts(2026, 3, 1, 9, 0))
                        .unwrap()
                        .conversation
                        .id
                })
            })
            .collect();
        let ids: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ids[0], ids[1]);
        let conn = database.connect().unwrap();
        assert_eq!(repository::list_conversations(&conn, Some(PHONE)).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_provider_id_rejected() {
        let conn = open_memory_database().unwrap();
        let sessions = manager(&conn);
        let conv = sessions.resolve_conversation(PHONE, ts(2026, 3, 1, 9, 0)).unwrap();
        let inbound = InboundMessage {
            text: "hola",
            message_type: MessageType::Text,
            external_id: Some("wamid.A"),
            received_at: ts(2026, 3, 1, 9, 0),
        };
        let ai = AiMetadata {
            confidence: 0.6,
            intent: IntentAction::General,
            urgency_level: UrgencyLevel::Low,
        };
        sessions.record_inbound(conv.conversation.id, &inbound, Some(ai)).unwrap();
        let again = sessions.record_inbound(conv.conversation.id, &inbound, None);
        assert!(matches!(again, Err(ConversationError::DuplicateMessage(_))));
        assert_eq!(sessions.history(conv.conversation.id).unwrap().len(), 1);
    }

    #[test]
    fn mark_urgent_sets_color_tag() {
        let conn = open_memory_database().unwrap();
        let sessions = manager(&conn);
        let conv = sessions.resolve_conversation(PHONE, ts(2026, 3, 1, 9, 0)).unwrap();
        sessions.mark_urgent(conv.conversation.id).unwrap();
        let stored = repository::get_conversation(&conn, &conv.conversation.id).unwrap().unwrap();
        assert_eq!(stored.color_tag.as_deref(), Some(URGENT_COLOR_TAG));
    }

    #[test]
    fn unknown_conversation_rejected() {
        let conn = open_memory_database().unwrap();
        let result = manager(&conn).record_outbound(Uuid::new_v4(), "x", MessageType::Text, ts(2026, 3, 1, 9, 0));
        assert!(matches!(result, Err(ConversationError::NotFound(_))));
    }

    #[test]
    fn ai_only_outside_working_hours() {
        let mut config = ClinicConfig::default();
        // Monday 10:00 is staffed; Saturday is not.
        assert!(!should_activate_ai(&config, &ts(2026, 3, 2, 10, 0)));
        assert!(should_activate_ai(&config, &ts(2026, 3, 7, 10, 0)));
        assert!(should_activate_ai(&config, &ts(2026, 3, 2, 22, 0)));
        config.ai.enabled = false;
        assert!(!should_activate_ai(&config, &ts(2026, 3, 7, 10, 0)));
    }

    #[test]
    fn phone_masking() {
        assert_eq!(mask_phone("34600111222"), "***1222");
        assert_eq!(mask_phone("12"), "****");
    }
}
