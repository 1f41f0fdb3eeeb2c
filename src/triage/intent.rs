use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::fold_text;
use crate::models::enums::IntentAction;

struct IntentPattern {
    regex: Regex,
    action: IntentAction,
    confidence: f32,
}

/// Checked in order; first match wins. `General` is the catch-all.
static INTENT_PATTERNS: LazyLock<Vec<IntentPattern>> = LazyLock::new(|| {
    vec![
        pattern(
            r"\b(?:urgencia|emergencia|me muero|sangr\w*|hinchad\w*|insoportable|accidente|absceso)\b",
            IntentAction::Emergency,
            0.9,
        ),
        pattern(
            r"\b(?:cita|reservar|agendar|pedir hora|reprogramar|disponib\w*|hueco|revision|limpieza)\b",
            IntentAction::Appointment,
            0.8,
        ),
        pattern(
            r"\b(?:precio|cuesta|cuanto|horario|donde|direccion|informacion|seguro|financ\w*|presupuesto)\b",
            IntentAction::Inquiry,
            0.7,
        ),
        pattern(
            r"\b(?:cancel(?:ar|o)\w*|anul(?:ar|o)\w*|no (?:puedo|podre) (?:ir|asistir|venir))\b",
            IntentAction::Cancellation,
            0.85,
        ),
        // Any other question, with no more weight than the catch-all.
        pattern(r"\?", IntentAction::Inquiry, 0.6),
    ]
});

static DAY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(pasado manana|manana|hoy|lunes|martes|miercoles|jueves|viernes|sabado|domingo)\b",
    )
    .expect("day pattern is valid")
});

static TIME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2}:\d{2})\b|\ba las (\d{1,2})\b").expect("time pattern is valid")
});

const GENERAL_CONFIDENCE: f32 = 0.6;

fn pattern(re: &str, action: IntentAction, confidence: f32) -> IntentPattern {
    IntentPattern {
        regex: Regex::new(re).expect("intent pattern is valid"),
        action,
        confidence,
    }
}

/// Best-effort date/time hints pulled from appointment requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_day: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResult {
    pub action: IntentAction,
    /// Fixed per pattern, not a probability.
    pub heuristic_confidence: f32,
    pub extracted_info: ExtractedInfo,
}

pub fn detect_intent(text: &str) -> IntentResult {
    let folded = fold_text(text);
    let matched = INTENT_PATTERNS.iter().find(|p| p.regex.is_match(&folded));

    let (action, heuristic_confidence) = match matched {
        Some(p) => (p.action, p.confidence),
        None => (IntentAction::General, GENERAL_CONFIDENCE),
    };

    let extracted_info = match action {
        IntentAction::Appointment => extract_info(&folded),
        _ => ExtractedInfo::default(),
    };

    IntentResult {
        action,
        heuristic_confidence,
        extracted_info,
    }
}

fn extract_info(folded: &str) -> ExtractedInfo {
    let preferred_day = DAY_PATTERN
        .captures(folded)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let preferred_time = TIME_PATTERN.captures(folded).and_then(|c| {
        c.get(1)
            .map(|m| m.as_str().to_string())
            .or_else(|| c.get(2).map(|m| format!("{}:00", m.as_str())))
    });
    ExtractedInfo {
        preferred_day,
        preferred_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_checked_first() {
        let result = detect_intent("Urgencia: me sangra la encía, ¿tienen cita hoy?");
        assert_eq!(result.action, IntentAction::Emergency);
        assert!((result.heuristic_confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn appointment_extracts_day_and_time() {
        let result = detect_intent("Quiero una cita el martes a las 10");
        assert_eq!(result.action, IntentAction::Appointment);
        assert_eq!(result.extracted_info.preferred_day.as_deref(), Some("martes"));
        assert_eq!(result.extracted_info.preferred_time.as_deref(), Some("10:00"));

        let result = detect_intent("¿Hay hueco mañana 17:30?");
        assert_eq!(result.extracted_info.preferred_day.as_deref(), Some("manana"));
        assert_eq!(result.extracted_info.preferred_time.as_deref(), Some("17:30"));
    }

    #[test]
    fn extraction_is_absent_when_nothing_matches() {
        let result = detect_intent("Necesito reservar");
        assert_eq!(result.action, IntentAction::Appointment);
        assert_eq!(result.extracted_info, ExtractedInfo::default());
    }

    #[test]
    fn inquiry_and_cancellation() {
        assert_eq!(detect_intent("¿Cuál es el precio?").action, IntentAction::Inquiry);
        let cancel = detect_intent("No podré ir, quiero anular");
        assert_eq!(cancel.action, IntentAction::Cancellation);
        assert!((cancel.heuristic_confidence - 0.85).abs() < f32::EPSILON);
    }

    #[test]
    fn question_mark_does_not_mask_cancellation() {
        let cancel = detect_intent("¿Podría anularla?");
        assert_eq!(cancel.action, IntentAction::Cancellation);
        assert_eq!(detect_intent("¿Puedo cancelarla?").action, IntentAction::Cancellation);

        let question = detect_intent("¿Atienden a niños?");
        assert_eq!(question.action, IntentAction::Inquiry);
        assert!((question.heuristic_confidence - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn falls_back_to_general() {
        let result = detect_intent("Gracias, muy amables");
        assert_eq!(result.action, IntentAction::General);
        assert!((result.heuristic_confidence - 0.6).abs() < f32::EPSILON);
    }
}
