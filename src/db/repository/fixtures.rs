//! Seed helpers shared by unit tests across the crate.

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::Connection;
use uuid::Uuid;

use super::*;
use crate::models::enums::{AppointmentStatus, ConversationStatus, FlowStatus};
use crate::models::*;

pub fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, 0)
        .unwrap()
}

pub fn seed_patient(conn: &Connection, phone: &str) -> Patient {
    seed_patient_at(conn, phone, ts(2026, 1, 1, 9, 0))
}

pub fn seed_patient_at(conn: &Connection, phone: &str, created_at: NaiveDateTime) -> Patient {
    let patient = Patient {
        id: Uuid::new_v4(),
        first_name: "Ana".into(),
        last_name: "Ruiz".into(),
        phone: phone.into(),
        email: None,
        created_at,
    };
    insert_patient(conn, &patient).unwrap();
    patient
}

pub fn seed_appointment(
    conn: &Connection,
    patient_id: &Uuid,
    scheduled_at: NaiveDateTime,
    status: AppointmentStatus,
) -> Appointment {
    let appt = Appointment {
        id: Uuid::new_v4(),
        patient_id: *patient_id,
        scheduled_at,
        treatment: "Limpieza".into(),
        status,
        notes: None,
        created_at: ts(2026, 1, 1, 9, 0),
        updated_at: ts(2026, 1, 1, 9, 0),
    };
    insert_appointment(conn, &appt).unwrap();
    appt
}

pub fn seed_conversation(conn: &Connection, phone: &str, at: NaiveDateTime) -> Conversation {
    let conv = Conversation {
        id: Uuid::new_v4(),
        phone_number: phone.into(),
        patient_id: None,
        appointment_id: None,
        status: ConversationStatus::Active,
        color_tag: None,
        last_activity_at: at,
        created_at: at,
    };
    insert_conversation(conn, &conv).unwrap();
    conv
}

pub fn seed_flow(conn: &Connection, appointment_id: &Uuid, config: FlowConfig) -> AutomationFlow {
    let flow = AutomationFlow {
        id: Uuid::new_v4(),
        appointment_id: *appointment_id,
        flow_type: "pre_visit".into(),
        config,
        current_step_index: 0,
        status: FlowStatus::Active,
        version: 0,
        created_at: ts(2026, 1, 1, 9, 0),
        updated_at: ts(2026, 1, 1, 9, 0),
    };
    insert_flow(conn, &flow).unwrap();
    flow
}

/// Welcome message followed by a confirm/cancel choice.
pub fn two_step_config() -> FlowConfig {
    FlowConfig::new(vec![
        StepConfig {
            message: "Bienvenido".into(),
            kind: StepKind::Message,
            requires_legal: false,
            branches: Default::default(),
            state_change: None,
        },
        StepConfig {
            message: "¿Confirma su cita?".into(),
            kind: StepKind::SingleChoice {
                buttons: vec![
                    ButtonOption { value: "confirm".into(), label: "Confirmar".into() },
                    ButtonOption { value: "cancel".into(), label: "Cancelar".into() },
                ],
            },
            requires_legal: false,
            branches: Default::default(),
            state_change: Some(AppointmentStatus::Confirmed),
        },
    ])
}
