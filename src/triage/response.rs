use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;

use super::generation::{GenerationClient, GenerationError};
use super::intent::IntentResult;
use super::urgency::UrgencyAssessment;
use crate::config::{AiConfig, ClinicInfo};
use crate::models::enums::{IntentAction, UrgencyLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePath {
    Emergency,
    Priority,
    Contextual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Generated,
    Fallback,
}

impl ResponsePath {
    /// Logged with every reply; never used for branching.
    fn heuristic_confidence(self, source: ResponseSource) -> f32 {
        match (self, source) {
            (Self::Emergency, ResponseSource::Generated) => 0.95,
            (Self::Emergency, ResponseSource::Fallback) => 0.90,
            (Self::Priority, ResponseSource::Generated) => 0.85,
            (Self::Priority, ResponseSource::Fallback) => 0.70,
            (Self::Contextual, ResponseSource::Generated) => 0.75,
            (Self::Contextual, ResponseSource::Fallback) => 0.60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedResponse {
    pub text: String,
    pub path: ResponsePath,
    pub source: ResponseSource,
    pub heuristic_confidence: f32,
    pub requires_human: bool,
    pub priority: UrgencyLevel,
    pub suggestions: Vec<String>,
}

/// What the generator may know about the sender.
#[derive(Debug, Clone, Default)]
pub struct PatientContext {
    pub name: Option<String>,
    pub next_appointment: Option<NaiveDateTime>,
}

/// Auto-reply policy: replies are withheld when disabled or when the urgency
/// score reaches the configured ceiling, leaving the message for staff.
pub fn should_auto_respond(ai: &AiConfig, urgency: &UrgencyAssessment) -> bool {
    ai.auto_response_enabled && urgency.score < ai.max_auto_response_score
}

/// Builds patient replies. Exactly one generation attempt per reply, bounded
/// by `timeout`; any failure falls back to a fixed template.
pub struct ResponseGenerator {
    client: Arc<dyn GenerationClient>,
    clinic: ClinicInfo,
    timeout: Duration,
}

impl ResponseGenerator {
    pub fn new(client: Arc<dyn GenerationClient>, clinic: ClinicInfo, timeout: Duration) -> Self {
        Self {
            client,
            clinic,
            timeout,
        }
    }

    pub async fn respond(
        &self,
        message: &str,
        urgency: &UrgencyAssessment,
        intent: &IntentResult,
        patient: &PatientContext,
    ) -> GeneratedResponse {
        let path = match urgency.level {
            UrgencyLevel::Critical => ResponsePath::Emergency,
            UrgencyLevel::Moderate => ResponsePath::Priority,
            _ => ResponsePath::Contextual,
        };

        let prompt = self.prompt(message, urgency, intent, patient);
        match self.try_generate(&prompt).await {
            Ok(text) => {
                let text = match path {
                    ResponsePath::Emergency => self.ensure_emergency_phone(text),
                    _ => text,
                };
                self.build(path, ResponseSource::Generated, text, intent.action)
            }
            Err(e) => {
                tracing::warn!(error = %e, path = ?path, "Generation failed; using template");
                self.fallback(path, intent.action)
            }
        }
    }

    /// Fixed emergency reply, used without any generation attempt (staffed
    /// hours, AI disabled).
    pub fn emergency_template(&self) -> GeneratedResponse {
        self.fallback(ResponsePath::Emergency, IntentAction::Emergency)
    }

    async fn try_generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let system = self.system_prompt();
        let text = tokio::time::timeout(self.timeout, self.client.generate(prompt, &system))
            .await
            .map_err(|_| GenerationError::Timeout(self.timeout))??;
        let text = text.trim();
        if text.is_empty() {
            return Err(GenerationError::Empty);
        }
        Ok(text.to_string())
    }

    fn fallback(&self, path: ResponsePath, action: IntentAction) -> GeneratedResponse {
        let text = match path {
            ResponsePath::Emergency => format!(
                "{}: hemos recibido su mensaje y entendemos que es urgente. Si tiene dolor \
                 intenso, sangrado que no cesa o hinchazón que le dificulta tragar o respirar, \
                 llame ahora al {}. Nuestro equipo le contactará lo antes posible.",
                self.clinic.name, self.clinic.emergency_phone
            ),
            ResponsePath::Priority => format!(
                "Gracias por escribirnos, sentimos las molestias. Daremos prioridad a su caso y \
                 le contactaremos en cuanto sea posible. Si empeora, llame al {} (urgencias: {}).",
                self.clinic.office_phone, self.clinic.emergency_phone
            ),
            ResponsePath::Contextual => self.contextual_template(action),
        };
        self.build(path, ResponseSource::Fallback, text, action)
    }

    fn contextual_template(&self, action: IntentAction) -> String {
        match action {
            IntentAction::Appointment => "Con gusto le ayudamos con su cita. Indíquenos qué día y \
                                          hora le vienen mejor y le confirmaremos la disponibilidad."
                .to_string(),
            IntentAction::Inquiry => format!(
                "Gracias por su consulta. Le responderemos en horario de atención; también puede \
                 llamarnos al {}.",
                self.clinic.office_phone
            ),
            IntentAction::Cancellation => "Hemos recibido su solicitud de cancelación. Un miembro \
                                           del equipo la gestionará y se la confirmará."
                .to_string(),
            IntentAction::Emergency => format!(
                "Si se trata de una urgencia, llame al {}. Le contactaremos lo antes posible.",
                self.clinic.emergency_phone
            ),
            IntentAction::General => format!(
                "Gracias por escribir a {}. Le responderemos lo antes posible.",
                self.clinic.name
            ),
        }
    }

    fn build(
        &self,
        path: ResponsePath,
        source: ResponseSource,
        text: String,
        action: IntentAction,
    ) -> GeneratedResponse {
        let (requires_human, priority) = match path {
            ResponsePath::Emergency => (true, UrgencyLevel::Critical),
            ResponsePath::Priority => (false, UrgencyLevel::Moderate),
            ResponsePath::Contextual => (false, UrgencyLevel::Low),
        };
        let suggestions = match path {
            ResponsePath::Contextual => suggestions_for(action),
            _ => Vec::new(),
        };
        GeneratedResponse {
            text,
            path,
            source,
            heuristic_confidence: path.heuristic_confidence(source),
            requires_human,
            priority,
            suggestions,
        }
    }

    fn ensure_emergency_phone(&self, text: String) -> String {
        if text.contains(&self.clinic.emergency_phone) {
            text
        } else {
            format!("{text}\n\nUrgencias: {}", self.clinic.emergency_phone)
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "Eres el asistente de WhatsApp de la clínica dental {}. Responde en español, con tono \
             cercano y profesional, en un máximo de tres frases. No des diagnósticos ni recomiendes \
             medicación. Teléfono de urgencias: {}. Teléfono de la clínica: {}.",
            self.clinic.name, self.clinic.emergency_phone, self.clinic.office_phone
        )
    }

    fn prompt(
        &self,
        message: &str,
        urgency: &UrgencyAssessment,
        intent: &IntentResult,
        patient: &PatientContext,
    ) -> String {
        let mut prompt = format!(
            "Urgencia: {} ({}/100). Intención: {}.\n",
            urgency.level, urgency.score, intent.action
        );
        if let Some(name) = &patient.name {
            prompt.push_str(&format!("Paciente: {name}.\n"));
        }
        if let Some(at) = &patient.next_appointment {
            prompt.push_str(&format!("Próxima cita: {}.\n", at.format("%d/%m/%Y %H:%M")));
        }
        prompt.push_str(&format!("Mensaje del paciente: \"{}\"", message.trim()));
        prompt
    }
}

fn suggestions_for(action: IntentAction) -> Vec<String> {
    let chips: &[&str] = match action {
        IntentAction::Appointment => &["Ver horarios disponibles", "Cambiar mi cita", "Hablar con recepción"],
        IntentAction::Inquiry => &["Precios", "Horario", "Cómo llegar"],
        IntentAction::Cancellation => &["Reprogramar cita", "Confirmar cancelación"],
        IntentAction::Emergency => &["Llamar a urgencias"],
        IntentAction::General => &["Pedir cita", "Horario", "Hablar con recepción"],
    };
    chips.iter().map(|c| c.to_string()).collect()
}
