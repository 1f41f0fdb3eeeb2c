//! Inbound message triage: keyword urgency scoring, intent detection and
//! reply generation with template fallback.
//!
//! Every confidence value produced here is a hand-assigned constant, not a
//! learned probability. Fields carrying them are named `heuristic_confidence`.

pub mod generation;
pub mod intent;
pub mod response;
pub mod urgency;

pub use generation::{
    DisabledGenerationClient, GenerationClient, GenerationError, HttpGenerationClient,
};
pub use intent::{detect_intent, ExtractedInfo, IntentResult};
pub use response::{
    should_auto_respond, GeneratedResponse, PatientContext, ResponseGenerator, ResponsePath,
    ResponseSource,
};
pub use urgency::{classify_urgency, ContextFactors, KeywordMatch, UrgencyAssessment};

/// Lowercase and strip Spanish diacritics so keyword tables can be written
/// without accents ("revisión" matches "revision").
pub fn fold_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' => 'a',
            'é' | 'è' | 'ë' => 'e',
            'í' | 'ì' | 'ï' => 'i',
            'ó' | 'ò' | 'ö' => 'o',
            'ú' | 'ù' | 'ü' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}
