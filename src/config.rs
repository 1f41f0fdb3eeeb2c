use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Dentaflow";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_WORKING_HOURS: &str =
    "mon=09:00-20:00;tue=09:00-20:00;wed=09:00-20:00;thu=09:00-20:00;fri=09:00-15:00";
const DEFAULT_GENERATION_MODEL: &str = "llama3.2";
const DEFAULT_WHATSAPP_API_URL: &str = "https://graph.facebook.com/v19.0";

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "dentaflow_lib=info,tower_http=info"
}

/// Default database location: `<data_local_dir>/dentaflow/clinic.db`.
pub fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dentaflow")
        .join("clinic.db")
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid working hours entry '{0}': expected day=HH:MM-HH:MM")]
    InvalidWorkingHours(String),
}

/// What happens to the step pointer when a step's processing fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepFailurePolicy {
    /// Record the failure and move on, so a flow never gets stuck.
    #[default]
    Advance,
    /// Record the failure and keep the pointer where it is.
    Halt,
}

impl FromStr for StepFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "advance" => Ok(Self::Advance),
            "halt" => Ok(Self::Halt),
            other => Err(format!("expected 'advance' or 'halt', got '{other}'")),
        }
    }
}

/// Staffed hours per weekday. A day without an entry is closed all day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingHours {
    days: [Option<(NaiveTime, NaiveTime)>; 7],
}

impl WorkingHours {
    pub fn closed() -> Self {
        Self { days: [None; 7] }
    }

    pub fn with_day(mut self, day: Weekday, open: NaiveTime, close: NaiveTime) -> Self {
        self.days[day.num_days_from_monday() as usize] = Some((open, close));
        self
    }

    /// True when `at` falls inside `[open, close)` for its weekday.
    pub fn contains(&self, at: &NaiveDateTime) -> bool {
        match self.days[at.weekday().num_days_from_monday() as usize] {
            Some((open, close)) => {
                let t = at.time();
                t >= open && t < close
            }
            None => false,
        }
    }

    pub fn hours_for(&self, day: Weekday) -> Option<(NaiveTime, NaiveTime)> {
        self.days[day.num_days_from_monday() as usize]
    }
}

impl Default for WorkingHours {
    fn default() -> Self {
        // The constant is known-good; fall back to closed rather than panic.
        DEFAULT_WORKING_HOURS.parse().unwrap_or_else(|_| Self::closed())
    }
}

impl FromStr for WorkingHours {
    type Err = ConfigError;

    /// Parses `mon=09:00-20:00;fri=09:00-15:00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hours = Self::closed();
        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = || ConfigError::InvalidWorkingHours(entry.to_string());
            let (day, range) = entry.split_once('=').ok_or_else(invalid)?;
            let day = Weekday::from_str(day.trim()).map_err(|_| invalid())?;
            let (open, close) = range.split_once('-').ok_or_else(invalid)?;
            let open = NaiveTime::parse_from_str(open.trim(), "%H:%M").map_err(|_| invalid())?;
            let close = NaiveTime::parse_from_str(close.trim(), "%H:%M").map_err(|_| invalid())?;
            if close <= open {
                return Err(invalid());
            }
            hours = hours.with_day(day, open, close);
        }
        Ok(hours)
    }
}

#[derive(Debug, Clone)]
pub struct ClinicInfo {
    pub name: String,
    pub emergency_phone: String,
    pub office_phone: String,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub enabled: bool,
    pub auto_response_enabled: bool,
    /// Urgency score at or above which no automatic reply is sent.
    pub max_auto_response_score: u8,
    /// Keyword confidence below which the intent detector decides a
    /// confirmation reply.
    pub confidence_threshold: f32,
    pub generation_url: Option<String>,
    pub generation_model: String,
    pub generation_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub api_url: String,
    pub phone_number_id: Option<String>,
    pub access_token: Option<String>,
    pub verify_token: Option<String>,
    pub app_secret: Option<String>,
}

impl WhatsAppConfig {
    /// Cloud API credentials, when both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.phone_number_id, &self.access_token) {
            (Some(id), Some(token)) => Some((id, token)),
            _ => None,
        }
    }
}

/// Everything the services read from the environment, resolved once at startup
/// and handed to each component explicitly.
#[derive(Debug, Clone)]
pub struct ClinicConfig {
    pub db_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub clinic: ClinicInfo,
    pub working_hours: WorkingHours,
    pub ai: AiConfig,
    pub confirmation_lead_hours: i64,
    pub confirmation_check_interval: Duration,
    pub step_failure_policy: StepFailurePolicy,
    pub conversation_window: chrono::Duration,
    pub default_country_code: String,
    pub whatsapp: WhatsAppConfig,
}

impl ClinicConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let working_hours = match get("CLINIC_WORKING_HOURS") {
            Some(raw) => raw.parse()?,
            None => WorkingHours::default(),
        };

        let confidence_threshold: f32 =
            parse_or("AI_CONFIDENCE_THRESHOLD", get("AI_CONFIDENCE_THRESHOLD"), 0.7)?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "AI_CONFIDENCE_THRESHOLD",
                value: confidence_threshold.to_string(),
                reason: "must be between 0 and 1".into(),
            });
        }

        let max_auto_response_score: u8 =
            parse_or("AI_MAX_AUTO_RESPONSE_SCORE", get("AI_MAX_AUTO_RESPONSE_SCORE"), 90)?;
        if max_auto_response_score > 100 {
            return Err(ConfigError::InvalidValue {
                key: "AI_MAX_AUTO_RESPONSE_SCORE",
                value: max_auto_response_score.to_string(),
                reason: "must be at most 100".into(),
            });
        }

        let window_hours: i64 =
            parse_or("CONVERSATION_WINDOW_HOURS", get("CONVERSATION_WINDOW_HOURS"), 24)?;
        let lead_hours: i64 =
            parse_or("CONFIRMATION_LEAD_HOURS", get("CONFIRMATION_LEAD_HOURS"), 24)?;
        for (key, value) in [
            ("CONVERSATION_WINDOW_HOURS", window_hours),
            ("CONFIRMATION_LEAD_HOURS", lead_hours),
        ] {
            if value <= 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                    reason: "must be positive".into(),
                });
            }
        }

        let country_code = get("DEFAULT_COUNTRY_CODE").unwrap_or_else(|| "34".into());
        if !country_code.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::InvalidValue {
                key: "DEFAULT_COUNTRY_CODE",
                value: country_code,
                reason: "digits only".into(),
            });
        }

        Ok(Self {
            db_path: get("DENTAFLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_db_path),
            bind_addr: parse_or(
                "DENTAFLOW_BIND_ADDR",
                get("DENTAFLOW_BIND_ADDR"),
                default_bind_addr(),
            )?,
            clinic: ClinicInfo {
                name: get("CLINIC_NAME").unwrap_or_else(|| "Clínica Dental".into()),
                emergency_phone: get("CLINIC_EMERGENCY_PHONE").unwrap_or_else(|| "112".into()),
                office_phone: get("CLINIC_OFFICE_PHONE").unwrap_or_else(|| "900000000".into()),
            },
            working_hours,
            ai: AiConfig {
                enabled: parse_or("AI_ENABLED", get("AI_ENABLED"), true)?,
                auto_response_enabled: parse_or(
                    "AI_AUTO_RESPONSE_ENABLED",
                    get("AI_AUTO_RESPONSE_ENABLED"),
                    true,
                )?,
                max_auto_response_score,
                confidence_threshold,
                generation_url: get("AI_GENERATION_URL"),
                generation_model: get("AI_GENERATION_MODEL")
                    .unwrap_or_else(|| DEFAULT_GENERATION_MODEL.into()),
                generation_timeout: Duration::from_secs(parse_or(
                    "AI_GENERATION_TIMEOUT_SECS",
                    get("AI_GENERATION_TIMEOUT_SECS"),
                    8,
                )?),
            },
            confirmation_lead_hours: lead_hours,
            confirmation_check_interval: Duration::from_secs(parse_or(
                "CONFIRMATION_CHECK_INTERVAL_SECS",
                get("CONFIRMATION_CHECK_INTERVAL_SECS"),
                900,
            )?),
            step_failure_policy: parse_or(
                "FLOW_STEP_FAILURE_POLICY",
                get("FLOW_STEP_FAILURE_POLICY"),
                StepFailurePolicy::Advance,
            )?,
            conversation_window: chrono::Duration::hours(window_hours),
            default_country_code: country_code,
            whatsapp: WhatsAppConfig {
                api_url: get("WHATSAPP_API_URL")
                    .unwrap_or_else(|| DEFAULT_WHATSAPP_API_URL.into()),
                phone_number_id: get("WHATSAPP_PHONE_NUMBER_ID"),
                access_token: get("WHATSAPP_ACCESS_TOKEN"),
                verify_token: get("WHATSAPP_VERIFY_TOKEN"),
                app_secret: get("WHATSAPP_APP_SECRET"),
            },
        })
    }
}

impl Default for ClinicConfig {
    /// Configuration with every variable unset.
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bind_addr: default_bind_addr(),
            clinic: ClinicInfo {
                name: "Clínica Dental".into(),
                emergency_phone: "112".into(),
                office_phone: "900000000".into(),
            },
            working_hours: WorkingHours::default(),
            ai: AiConfig {
                enabled: true,
                auto_response_enabled: true,
                max_auto_response_score: 90,
                confidence_threshold: 0.7,
                generation_url: None,
                generation_model: DEFAULT_GENERATION_MODEL.into(),
                generation_timeout: Duration::from_secs(8),
            },
            confirmation_lead_hours: 24,
            confirmation_check_interval: Duration::from_secs(900),
            step_failure_policy: StepFailurePolicy::Advance,
            conversation_window: chrono::Duration::hours(24),
            default_country_code: "34".into(),
            whatsapp: WhatsAppConfig {
                api_url: DEFAULT_WHATSAPP_API_URL.into(),
                phone_number_id: None,
                access_token: None,
                verify_token: None,
                app_secret: None,
            },
        }
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ClinicConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClinicConfig::from_lookup(|key| vars.get(key).cloned())
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, min, 0).unwrap()
    }

    #[test]
    fn defaults_when_environment_empty() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.clinic.emergency_phone, "112");
        assert_eq!(config.ai.max_auto_response_score, 90);
        assert!((config.ai.confidence_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.confirmation_lead_hours, 24);
        assert_eq!(config.step_failure_policy, StepFailurePolicy::Advance);
        assert_eq!(config.conversation_window, chrono::Duration::hours(24));
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.ai.generation_url.is_none());
        assert!(config.whatsapp.credentials().is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("CLINIC_EMERGENCY_PHONE", "600123123"),
            ("AI_ENABLED", "false"),
            ("FLOW_STEP_FAILURE_POLICY", "Halt"),
            ("WHATSAPP_PHONE_NUMBER_ID", "12345"),
            ("WHATSAPP_ACCESS_TOKEN", "token"),
            ("AI_GENERATION_TIMEOUT_SECS", "3"),
        ])
        .unwrap();
        assert_eq!(config.clinic.emergency_phone, "600123123");
        assert!(!config.ai.enabled);
        assert_eq!(config.step_failure_policy, StepFailurePolicy::Halt);
        assert_eq!(config.whatsapp.credentials(), Some(("12345", "token")));
        assert_eq!(config.ai.generation_timeout, Duration::from_secs(3));
    }

    #[test]
    fn invalid_values_fail_instead_of_defaulting() {
        assert!(matches!(
            config_from(&[("AI_CONFIDENCE_THRESHOLD", "1.5")]),
            Err(ConfigError::InvalidValue { key: "AI_CONFIDENCE_THRESHOLD", .. })
        ));
        assert!(config_from(&[("AI_ENABLED", "maybe")]).is_err());
        assert!(config_from(&[("FLOW_STEP_FAILURE_POLICY", "retry")]).is_err());
        assert!(config_from(&[("CONVERSATION_WINDOW_HOURS", "0")]).is_err());
        assert!(config_from(&[("DEFAULT_COUNTRY_CODE", "+34")]).is_err());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[("CLINIC_NAME", "  "), ("AI_GENERATION_URL", "")]).unwrap();
        assert_eq!(config.clinic.name, "Clínica Dental");
        assert!(config.ai.generation_url.is_none());
    }

    #[test]
    fn default_working_hours() {
        let hours = WorkingHours::default();
        // 2026-03-02 is a Monday.
        assert!(hours.contains(&at(2026, 3, 2, 9, 0)));
        assert!(hours.contains(&at(2026, 3, 2, 19, 59)));
        assert!(!hours.contains(&at(2026, 3, 2, 20, 0)));
        assert!(!hours.contains(&at(2026, 3, 2, 8, 59)));
        // Friday closes early.
        assert!(!hours.contains(&at(2026, 3, 6, 16, 0)));
        // Weekend has no entry.
        assert!(!hours.contains(&at(2026, 3, 7, 11, 0)));
        assert!(!hours.contains(&at(2026, 3, 8, 11, 0)));
    }

    #[test]
    fn working_hours_parse() {
        let hours: WorkingHours = "sat=10:00-14:00".parse().unwrap();
        assert!(hours.contains(&at(2026, 3, 7, 11, 0)));
        assert!(!hours.contains(&at(2026, 3, 2, 11, 0)));
        assert!(hours.hours_for(Weekday::Sat).is_some());

        assert!("mon=20:00-09:00".parse::<WorkingHours>().is_err());
        assert!("funday=09:00-10:00".parse::<WorkingHours>().is_err());
        assert!("mon 09:00-10:00".parse::<WorkingHours>().is_err());
    }

    #[test]
    fn app_name_is_dentaflow() {
        assert_eq!(APP_NAME, "Dentaflow");
    }
}
