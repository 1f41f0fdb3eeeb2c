use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{format_timestamp, optional, parse_timestamp, parse_uuid, DatabaseError};
use crate::models::enums::{
    ConversationStatus, IntentAction, MessageDirection, MessageType, UrgencyLevel,
};
use crate::models::{AiMetadata, Conversation, Message};

const CONVERSATION_COLUMNS: &str = "id, phone_number, patient_id, appointment_id, status, \
                                    color_tag, last_activity_at, created_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, direction, body, message_type, external_id, \
                               sent_at, is_read, ai_confidence, ai_intent, ai_urgency";

pub fn insert_conversation(conn: &Connection, conv: &Conversation) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO whatsapp_conversations
         (id, phone_number, patient_id, appointment_id, status, color_tag, last_activity_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            conv.id.to_string(),
            conv.phone_number,
            conv.patient_id.map(|id| id.to_string()),
            conv.appointment_id.map(|id| id.to_string()),
            conv.status.as_str(),
            conv.color_tag,
            format_timestamp(&conv.last_activity_at),
            format_timestamp(&conv.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_conversation(conn: &Connection, id: &Uuid) -> Result<Option<Conversation>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM whatsapp_conversations WHERE id = ?1"),
        params![id.to_string()],
        ConversationRow::read,
    ))?;
    row.map(conversation_from_row).transpose()
}

/// Most recently active conversation for a phone number.
pub fn latest_conversation_for_phone(
    conn: &Connection,
    phone: &str,
) -> Result<Option<Conversation>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!(
            "SELECT {CONVERSATION_COLUMNS} FROM whatsapp_conversations
             WHERE phone_number = ?1
             ORDER BY last_activity_at DESC, created_at DESC LIMIT 1"
        ),
        params![phone],
        ConversationRow::read,
    ))?;
    row.map(conversation_from_row).transpose()
}

pub fn list_conversations(
    conn: &Connection,
    phone: Option<&str>,
) -> Result<Vec<Conversation>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM whatsapp_conversations
         WHERE ?1 IS NULL OR phone_number = ?1
         ORDER BY last_activity_at DESC"
    ))?;
    let rows = stmt.query_map(params![phone], ConversationRow::read)?;

    let mut conversations = Vec::new();
    for row in rows {
        conversations.push(conversation_from_row(row?)?);
    }
    Ok(conversations)
}

/// Move `last_activity_at` forward. Never moves it backwards when an older
/// message is recorded late.
pub fn touch_conversation(
    conn: &Connection,
    id: &Uuid,
    at: &NaiveDateTime,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE whatsapp_conversations
         SET last_activity_at = MAX(last_activity_at, ?1) WHERE id = ?2",
        params![format_timestamp(at), id.to_string()],
    )?;
    Ok(())
}

pub fn set_conversation_color_tag(
    conn: &Connection,
    id: &Uuid,
    tag: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE whatsapp_conversations SET color_tag = ?1 WHERE id = ?2",
        params![tag, id.to_string()],
    )?;
    Ok(())
}

pub fn set_conversation_links(
    conn: &Connection,
    id: &Uuid,
    patient_id: Option<&Uuid>,
    appointment_id: Option<&Uuid>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE whatsapp_conversations
         SET patient_id = COALESCE(?1, patient_id), appointment_id = COALESCE(?2, appointment_id)
         WHERE id = ?3",
        params![
            patient_id.map(|id| id.to_string()),
            appointment_id.map(|id| id.to_string()),
            id.to_string(),
        ],
    )?;
    Ok(())
}

pub fn insert_message(conn: &Connection, msg: &Message) -> Result<(), DatabaseError> {
    let ai = msg.ai_metadata.as_ref();
    conn.execute(
        "INSERT INTO whatsapp_messages
         (id, conversation_id, direction, body, message_type, external_id, sent_at, is_read,
          ai_confidence, ai_intent, ai_urgency)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            msg.id.to_string(),
            msg.conversation_id.to_string(),
            msg.direction.as_str(),
            msg.text,
            msg.message_type.as_str(),
            msg.external_id,
            format_timestamp(&msg.sent_at),
            msg.is_read,
            ai.map(|m| m.confidence),
            ai.map(|m| m.intent.as_str()),
            ai.map(|m| m.urgency_level.as_str()),
        ],
    )?;
    Ok(())
}

pub fn get_message(conn: &Connection, id: &Uuid) -> Result<Option<Message>, DatabaseError> {
    let row = optional(conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM whatsapp_messages WHERE id = ?1"),
        params![id.to_string()],
        MessageRow::read,
    ))?;
    row.map(message_from_row).transpose()
}

/// True when a message with this provider id was already stored.
pub fn message_exists_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> Result<bool, DatabaseError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM whatsapp_messages WHERE external_id = ?1)",
        params![external_id],
        |row| row.get::<_, bool>(0),
    )?;
    Ok(exists)
}

pub fn get_messages_by_conversation(
    conn: &Connection,
    conversation_id: &Uuid,
) -> Result<Vec<Message>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM whatsapp_messages WHERE conversation_id = ?1
         ORDER BY sent_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map(params![conversation_id.to_string()], MessageRow::read)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(message_from_row(row?)?);
    }
    Ok(messages)
}

/// Returns false when the message does not exist.
pub fn mark_message_read(conn: &Connection, id: &Uuid) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE whatsapp_messages SET is_read = 1 WHERE id = ?1",
        params![id.to_string()],
    )?;
    Ok(changed == 1)
}

struct ConversationRow {
    id: String,
    phone_number: String,
    patient_id: Option<String>,
    appointment_id: Option<String>,
    status: String,
    color_tag: Option<String>,
    last_activity_at: String,
    created_at: String,
}

impl ConversationRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            phone_number: row.get(1)?,
            patient_id: row.get(2)?,
            appointment_id: row.get(3)?,
            status: row.get(4)?,
            color_tag: row.get(5)?,
            last_activity_at: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

fn conversation_from_row(row: ConversationRow) -> Result<Conversation, DatabaseError> {
    Ok(Conversation {
        id: parse_uuid(&row.id)?,
        phone_number: row.phone_number,
        patient_id: row.patient_id.as_deref().map(parse_uuid).transpose()?,
        appointment_id: row.appointment_id.as_deref().map(parse_uuid).transpose()?,
        status: ConversationStatus::from_str(&row.status)?,
        color_tag: row.color_tag,
        last_activity_at: parse_timestamp(&row.last_activity_at)?,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

struct MessageRow {
    id: String,
    conversation_id: String,
    direction: String,
    body: String,
    message_type: String,
    external_id: Option<String>,
    sent_at: String,
    is_read: bool,
    ai_confidence: Option<f32>,
    ai_intent: Option<String>,
    ai_urgency: Option<String>,
}

impl MessageRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            direction: row.get(2)?,
            body: row.get(3)?,
            message_type: row.get(4)?,
            external_id: row.get(5)?,
            sent_at: row.get(6)?,
            is_read: row.get(7)?,
            ai_confidence: row.get(8)?,
            ai_intent: row.get(9)?,
            ai_urgency: row.get(10)?,
        })
    }
}

fn message_from_row(row: MessageRow) -> Result<Message, DatabaseError> {
    // All three AI columns are written together; a partial set is treated as absent.
    let ai_metadata = match (row.ai_confidence, row.ai_intent, row.ai_urgency) {
        (Some(confidence), Some(intent), Some(urgency)) => Some(AiMetadata {
            confidence,
            intent: IntentAction::from_str(&intent)?,
            urgency_level: UrgencyLevel::from_str(&urgency)?,
        }),
        _ => None,
    };
    Ok(Message {
        id: parse_uuid(&row.id)?,
        conversation_id: parse_uuid(&row.conversation_id)?,
        direction: MessageDirection::from_str(&row.direction)?,
        text: row.body,
        message_type: MessageType::from_str(&row.message_type)?,
        external_id: row.external_id,
        sent_at: parse_timestamp(&row.sent_at)?,
        is_read: row.is_read,
        ai_metadata,
    })
}
