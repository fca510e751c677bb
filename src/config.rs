//! Environment-driven configuration, read once at startup.

use std::env;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MAX_MESSAGES_GUEST: i64 = 20;
pub const DEFAULT_MAX_MESSAGES_REGULAR: i64 = 100;
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24 * 7;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Which backing store the resumable stream registry should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumableBackend {
    Redis(String),
    Memory,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub openai_api_base: String,
    pub openai_api_key: String,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub cors_origins: Vec<String>,
    pub resumable_backend: ResumableBackend,
    pub max_messages_guest: i64,
    pub max_messages_regular: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("DATABASE_URL")?;
        let openai_api_key = required("OPENAI_API_KEY")?;
        let jwt_secret = required("JWT_SECRET")?;

        let port = parse_or("PORT", DEFAULT_PORT)?;
        let token_ttl_hours = parse_or("TOKEN_TTL_HOURS", DEFAULT_TOKEN_TTL_HOURS)?;
        let max_messages_guest = parse_or("MAX_MESSAGES_GUEST", DEFAULT_MAX_MESSAGES_GUEST)?;
        let max_messages_regular = parse_or("MAX_MESSAGES_REGULAR", DEFAULT_MAX_MESSAGES_REGULAR)?;

        let openai_api_base =
            env::var("OPENAI_API_BASE").unwrap_or_else(|_| DEFAULT_OPENAI_API_BASE.to_string());

        let cors_origins = env::var("CORS_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let resumable_backend = resumable_backend_from(
            env::var("RESUMABLE_STREAMS").ok().as_deref(),
            env::var("REDIS_URL").ok(),
        );

        Ok(Self {
            port,
            database_url,
            openai_api_base,
            openai_api_key,
            jwt_secret,
            token_ttl_hours,
            cors_origins,
            resumable_backend,
            max_messages_guest,
            max_messages_regular,
        })
    }
}

/// `RESUMABLE_STREAMS` picks the backend explicitly; otherwise Redis is used
/// whenever `REDIS_URL` is present and resumption is disabled when it isn't.
pub fn resumable_backend_from(mode: Option<&str>, redis_url: Option<String>) -> ResumableBackend {
    match mode.map(|m| m.trim().to_lowercase()).as_deref() {
        Some("memory") => ResumableBackend::Memory,
        Some("off") | Some("disabled") | Some("false") => ResumableBackend::Disabled,
        Some("redis") | None => match redis_url.filter(|u| !u.trim().is_empty()) {
            Some(url) => ResumableBackend::Redis(url),
            None => ResumableBackend::Disabled,
        },
        Some(other) => {
            warn!("Unknown RESUMABLE_STREAMS value '{}', disabling resumable streams", other);
            ResumableBackend::Disabled
        }
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(key, raw)),
        Err(_) => Ok(default),
    }
}
