use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::fold_text;
use crate::models::enums::UrgencyLevel;

const PHONE_BOOST: f64 = 0.5;
const TIME_BOOST: f64 = 0.3;
const PAIN_BOOST: f64 = 0.8;

/// Phrases are accent-free and lowercase; input goes through [`fold_text`].
const CRITICAL_KEYWORDS: &[&str] = &[
    "emergencia",
    "me muero",
    "sangrado",
    "sangra mucho",
    "no para de sangrar",
    "hinchazon",
    "hinchada",
    "hinchado",
    "fiebre",
    "absceso",
    "sale pus",
    "accidente",
    "golpe en la boca",
    "diente roto",
    "se me ha roto",
    "se me ha caido un diente",
    "no puedo abrir la boca",
    "no puedo tragar",
    "no puedo dormir",
    "insoportable",
];

const MODERATE_KEYWORDS: &[&str] = &[
    "dolor",
    "me duele",
    "molestia",
    "sensibilidad",
    "empaste",
    "corona",
    "la encia",
    "las encias",
    "brackets",
    "protesis",
    "muela",
    "flemon",
];

const APPOINTMENT_KEYWORDS: &[&str] = &[
    "cita",
    "reservar",
    "agendar",
    "pedir hora",
    "disponibilidad",
    "hueco",
    "revision",
    "limpieza",
    "cambiar",
    "cancelar",
    "anular",
    "confirmo",
    "confirmar",
];

const INQUIRY_KEYWORDS: &[&str] = &[
    "precio",
    "cuanto cuesta",
    "cuanto vale",
    "horario",
    "direccion",
    "donde estan",
    "presupuesto",
    "financiacion",
    "seguro",
    "informacion",
    "tarjeta",
];

static PHONE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?\d[\s.-]?){9,}").expect("phone pattern is valid")
});

static TIME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:hoy|ahora|urgente|cuanto antes|esta noche)\b").expect("time pattern is valid")
});

static PAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:dolor\w*|duele\w*|doliendo|punzante|insoportable|me muero)\b")
        .expect("pain pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordMatch {
    pub keyword: String,
    pub category: UrgencyLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextFactors {
    pub has_phone: bool,
    pub has_time: bool,
    pub has_pain: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrgencyAssessment {
    pub level: UrgencyLevel,
    /// 0 to 100.
    pub score: u8,
    pub matched_keywords: Vec<KeywordMatch>,
    pub context_factors: ContextFactors,
}

impl UrgencyAssessment {
    pub fn is_critical(&self) -> bool {
        self.level == UrgencyLevel::Critical
    }
}

#[derive(Default)]
struct Tally {
    critical: f64,
    moderate: f64,
    appointment: f64,
    inquiry: f64,
}

/// Score a patient message. Pure and deterministic.
///
/// Levels are decided in strict priority order, so a message that qualifies
/// as critical is never downgraded by other keywords it also contains.
pub fn classify_urgency(text: &str) -> UrgencyAssessment {
    let folded = fold_text(text);
    let mut tally = Tally::default();
    let mut matched_keywords = Vec::new();

    for (keywords, level, slot) in [
        (CRITICAL_KEYWORDS, UrgencyLevel::Critical, &mut tally.critical),
        (MODERATE_KEYWORDS, UrgencyLevel::Moderate, &mut tally.moderate),
        (APPOINTMENT_KEYWORDS, UrgencyLevel::Appointment, &mut tally.appointment),
        (INQUIRY_KEYWORDS, UrgencyLevel::Inquiry, &mut tally.inquiry),
    ] {
        for keyword in keywords {
            if folded.contains(keyword) {
                *slot += 1.0;
                matched_keywords.push(KeywordMatch {
                    keyword: (*keyword).to_string(),
                    category: level,
                });
            }
        }
    }

    let context_factors = ContextFactors {
        has_phone: PHONE_PATTERN.is_match(&folded),
        has_time: TIME_PATTERN.is_match(&folded),
        has_pain: PAIN_PATTERN.is_match(&folded),
    };
    if context_factors.has_phone {
        tally.critical += PHONE_BOOST;
    }
    if context_factors.has_time {
        tally.moderate += TIME_BOOST;
    }
    if context_factors.has_pain {
        tally.critical += PAIN_BOOST;
    }

    let (level, score) = if tally.critical >= 1.5
        || (tally.critical >= 1.0 && context_factors.has_pain)
    {
        (UrgencyLevel::Critical, scale(tally.critical, 20.0))
    } else if tally.moderate >= 1.0 {
        (UrgencyLevel::Moderate, scale(tally.moderate, 15.0))
    } else if tally.appointment >= 1.0 {
        (UrgencyLevel::Appointment, scale(tally.appointment, 10.0))
    } else if tally.inquiry >= 1.0 {
        (UrgencyLevel::Inquiry, scale(tally.inquiry, 8.0))
    } else {
        (UrgencyLevel::Low, 0)
    };

    UrgencyAssessment {
        level,
        score,
        matched_keywords,
        context_factors,
    }
}

fn scale(tally: f64, factor: f64) -> u8 {
    (tally * factor).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pain_with_critical_keyword_is_critical() {
        let result = classify_urgency("Me muero de dolor, no puedo dormir");
        assert_eq!(result.level, UrgencyLevel::Critical);
        assert!(result.context_factors.has_pain);
        assert!(result.score > 0);
    }

    #[test]
    fn critical_never_downgraded_by_other_keywords() {
        let messages = [
            "tengo la cara hinchada y mucho dolor",
            "sangrado y dolor, quería cambiar la cita y saber el precio",
            "dolor insoportable, ¿cuál es el horario? quiero pedir hora",
            "absceso con dolor, información del seguro, revisión, limpieza, presupuesto",
        ];
        for message in messages {
            let result = classify_urgency(message);
            assert_eq!(result.level, UrgencyLevel::Critical, "message: {message}");
        }
    }

    #[test]
    fn pain_alone_is_moderate() {
        let result = classify_urgency("Tengo un poco de dolor en una muela");
        assert_eq!(result.level, UrgencyLevel::Moderate);
        assert_eq!(result.score, 30);
    }

    #[test]
    fn time_word_boosts_moderate() {
        let result = classify_urgency("¿Me pueden atender hoy?");
        assert!(result.context_factors.has_time);
        // 0.3 alone does not reach the moderate threshold.
        assert_eq!(result.level, UrgencyLevel::Low);

        let result = classify_urgency("Tengo sensibilidad, ¿me pueden ver hoy?");
        assert_eq!(result.level, UrgencyLevel::Moderate);
        assert!(result.score > 15);
    }

    #[test]
    fn phone_number_boosts_critical() {
        let result = classify_urgency("Emergencia, llámenme al 600 123 456");
        assert!(result.context_factors.has_phone);
        assert_eq!(result.level, UrgencyLevel::Critical);
        assert_eq!(result.score, 30);
    }

    #[test]
    fn appointment_and_inquiry_levels() {
        let result = classify_urgency("Quería pedir cita para una revisión");
        assert_eq!(result.level, UrgencyLevel::Appointment);
        assert_eq!(result.score, 20);

        let result = classify_urgency("¿Cuánto cuesta un blanqueamiento?");
        assert_eq!(result.level, UrgencyLevel::Inquiry);
        assert_eq!(result.score, 8);
    }

    #[test]
    fn nothing_matched_is_low() {
        let result = classify_urgency("Hola, buenas tardes");
        assert_eq!(result.level, UrgencyLevel::Low);
        assert_eq!(result.score, 0);
        assert!(result.matched_keywords.is_empty());
    }

    #[test]
    fn score_is_capped_at_100() {
        let result = classify_urgency(
            "emergencia me muero sangrado hinchazon fiebre absceso sale pus accidente insoportable",
        );
        assert_eq!(result.level, UrgencyLevel::Critical);
        assert_eq!(result.score, 100);
    }
}
