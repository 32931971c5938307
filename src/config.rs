use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub llm_provider: String,
    pub llm_model: String,
    pub fallback_provider: Option<String>,
    pub fallback_model: String,
    pub gcp_project_id: Option<String>,
    pub gcp_location: String,
    pub gcp_access_token: Option<String>,
    pub ollama_base_url: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub model_timeout_secs: u64,
    pub model_max_attempts: u32,
    pub model_base_delay_ms: u64,
    pub sendgrid_api_key: Option<String>,
    pub sendgrid_base_url: Option<String>,
    pub from_email: Option<String>,
    pub to_email: Option<String>,
    pub delivery_timeout_secs: u64,
    pub delivery_max_attempts: u32,
    pub delivery_base_delay_ms: u64,
    pub report_archive_dir: Option<PathBuf>,
    pub otel_service_name: String,
    pub otel_exporter_endpoint: String,
    pub default_temperature: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            environment: "development".to_string(),
            llm_provider: "vertex".to_string(),
            llm_model: "gemini-2.0-flash".to_string(),
            fallback_provider: None,
            fallback_model: "claude-haiku-4-5-20251001".to_string(),
            gcp_project_id: None,
            gcp_location: "us-central1".to_string(),
            gcp_access_token: None,
            ollama_base_url: "http://localhost:11434".to_string(),
            openai_api_key: None,
            anthropic_api_key: None,
            google_api_key: None,
            model_timeout_secs: 30,
            model_max_attempts: 4,
            model_base_delay_ms: 1000,
            sendgrid_api_key: None,
            sendgrid_base_url: None,
            from_email: None,
            to_email: None,
            delivery_timeout_secs: 15,
            delivery_max_attempts: 3,
            delivery_base_delay_ms: 500,
            report_archive_dir: None,
            otel_service_name: "market-report-agent".to_string(),
            otel_exporter_endpoint: "http://localhost:4317".to_string(),
            default_temperature: 0.3,
        }
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::Configuration(format!("{name} must be a valid number, got {raw:?}"))
        }),
    }
}

impl Config {
    /// Loads `.env` if present, then reads the process environment. Only the
    /// binary calls this; library code receives a `Config` by value.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            port: parsed("APP_PORT", defaults.port)?,
            environment: optional("APP_ENVIRONMENT").unwrap_or(defaults.environment),
            llm_provider: optional("LLM_PROVIDER").unwrap_or(defaults.llm_provider),
            llm_model: optional("LLM_MODEL").unwrap_or(defaults.llm_model),
            fallback_provider: optional("FALLBACK_PROVIDER"),
            fallback_model: optional("FALLBACK_MODEL").unwrap_or(defaults.fallback_model),
            gcp_project_id: optional("GOOGLE_CLOUD_PROJECT_ID"),
            gcp_location: optional("GOOGLE_CLOUD_LOCATION").unwrap_or(defaults.gcp_location),
            gcp_access_token: optional("GOOGLE_CLOUD_ACCESS_TOKEN"),
            ollama_base_url: optional("OLLAMA_BASE_URL").unwrap_or(defaults.ollama_base_url),
            openai_api_key: optional("OPENAI_API_KEY"),
            anthropic_api_key: optional("ANTHROPIC_API_KEY"),
            google_api_key: optional("GOOGLE_API_KEY"),
            model_timeout_secs: parsed("MODEL_TIMEOUT_SECS", defaults.model_timeout_secs)?,
            model_max_attempts: parsed("MODEL_MAX_ATTEMPTS", defaults.model_max_attempts)?,
            model_base_delay_ms: parsed("MODEL_BASE_DELAY_MS", defaults.model_base_delay_ms)?,
            sendgrid_api_key: optional("SENDGRID_API_KEY"),
            sendgrid_base_url: optional("SENDGRID_BASE_URL"),
            from_email: optional("FROM_EMAIL"),
            to_email: optional("TO_EMAIL"),
            delivery_timeout_secs: parsed("DELIVERY_TIMEOUT_SECS", defaults.delivery_timeout_secs)?,
            delivery_max_attempts: parsed("DELIVERY_MAX_ATTEMPTS", defaults.delivery_max_attempts)?,
            delivery_base_delay_ms: parsed(
                "DELIVERY_BASE_DELAY_MS",
                defaults.delivery_base_delay_ms,
            )?,
            report_archive_dir: optional("REPORT_ARCHIVE_DIR").map(PathBuf::from),
            otel_service_name: optional("OTEL_SERVICE_NAME").unwrap_or(defaults.otel_service_name),
            otel_exporter_endpoint: optional("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or(defaults.otel_exporter_endpoint),
            default_temperature: parsed("DEFAULT_TEMPERATURE", defaults.default_temperature)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Catches settings that would only fail later, mid-run.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.model_timeout_secs == 0 || self.delivery_timeout_secs == 0 {
            return Err(AppError::Configuration(
                "timeouts must be greater than zero".into(),
            ));
        }
        if self.model_max_attempts == 0 || self.delivery_max_attempts == 0 {
            return Err(AppError::Configuration(
                "max attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(AppError::Configuration(format!(
                "DEFAULT_TEMPERATURE must be within [0, 2], got {}",
                self.default_temperature
            )));
        }
        if self.sendgrid_api_key.is_some() && self.from_email.is_none() {
            return Err(AppError::Configuration(
                "FROM_EMAIL must be set when SENDGRID_API_KEY is configured".into(),
            ));
        }
        Ok(())
    }

    /// Email delivery needs both an API key and a sender.
    pub fn email_enabled(&self) -> bool {
        self.sendgrid_api_key.is_some() && self.from_email.is_some()
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
