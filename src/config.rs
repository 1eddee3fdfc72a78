use crate::error::ConfigError;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How the gateway client verifies server certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsVerification {
    Enabled,
    Disabled,
    CaBundle(PathBuf),
}

#[derive(Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    pub telegram_api_url: String,
    pub database_url: String,
    /// Sender label the bot itself posts under; never ingested.
    pub self_identity: Option<String>,
    /// When set, only this conversation (username or numeric id) is captured.
    pub monitor_peer: Option<String>,
    pub backfill_limit: usize,
    pub connect_retry_delay: Duration,

    // Summarization gateway
    pub gateway_client_id: Option<String>,
    pub gateway_client_secret: Option<String>,
    pub gateway_scope: String,
    pub gateway_oauth_url: String,
    pub gateway_api_url: String,
    pub gateway_model: String,
    pub gateway_tls: TlsVerification,
    pub gateway_token_timeout: Duration,
    pub gateway_completion_timeout: Duration,

    // Batch trigger
    pub summary_batch_limit: usize,
    pub summary_min_length: usize,
    pub summary_system_prompt: String,
}

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an assistant that writes short, faithful digests of chat conversations. \
Summarize the key points, decisions and open questions from the messages below.";

pub const DEFAULT_OAUTH_URL: &str = "https://ngw.devices.sberbank.ru:9443/api/v2/oauth";
pub const DEFAULT_API_URL: &str = "https://gigachat.devices.sberbank.ru/api/v1";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> Result<Self, ConfigError> {
        Ok(Config {
            telegram_bot_token: required("TELEGRAM_BOT_TOKEN")?,
            telegram_api_url: env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "messages.db".to_string()),
            self_identity: optional("SELF_IDENTITY"),
            monitor_peer: optional("MONITOR_PEER"),
            backfill_limit: parsed("BACKFILL_LIMIT", 100)?,
            connect_retry_delay: duration("CONNECT_RETRY_DELAY", Duration::from_secs(3))?,

            gateway_client_id: optional("GATEWAY_CLIENT_ID"),
            gateway_client_secret: optional("GATEWAY_CLIENT_SECRET"),
            gateway_scope: env::var("GATEWAY_SCOPE")
                .unwrap_or_else(|_| "GIGACHAT_API_PERS".to_string()),
            gateway_oauth_url: env::var("GATEWAY_OAUTH_URL")
                .unwrap_or_else(|_| DEFAULT_OAUTH_URL.to_string()),
            gateway_api_url: env::var("GATEWAY_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            gateway_model: env::var("GATEWAY_MODEL").unwrap_or_else(|_| "GigaChat".to_string()),
            gateway_tls: tls_verification(),
            gateway_token_timeout: duration("GATEWAY_TOKEN_TIMEOUT", Duration::from_secs(30))?,
            gateway_completion_timeout: duration(
                "GATEWAY_COMPLETION_TIMEOUT",
                Duration::from_secs(60),
            )?,

            summary_batch_limit: parsed("SUMMARY_BATCH_LIMIT", 100)?,
            summary_min_length: parsed("SUMMARY_MIN_LENGTH", 10)?,
            summary_system_prompt: env::var("SUMMARY_SYSTEM_PROMPT")
                .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string()),
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

/// Unset and blank values are treated the same.
fn optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

fn duration(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match optional(var) {
        Some(value) => humantime::parse_duration(value.trim())
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

/// A CA bundle path wins over the boolean toggle.
fn tls_verification() -> TlsVerification {
    if let Some(path) = optional("GATEWAY_CA_BUNDLE") {
        return TlsVerification::CaBundle(PathBuf::from(path));
    }
    match optional("GATEWAY_VERIFY") {
        None => TlsVerification::Enabled,
        Some(flag) => {
            if matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes" | "y") {
                TlsVerification::Enabled
            } else {
                TlsVerification::Disabled
            }
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("telegram_bot_token", &"[REDACTED]")
            .field("telegram_api_url", &self.telegram_api_url)
            .field("database_url", &self.database_url)
            .field("self_identity", &self.self_identity)
            .field("monitor_peer", &self.monitor_peer)
            .field("backfill_limit", &self.backfill_limit)
            .field("connect_retry_delay", &self.connect_retry_delay)
            .field(
                "gateway_client_id",
                &self.gateway_client_id.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "gateway_client_secret",
                &self.gateway_client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("gateway_scope", &self.gateway_scope)
            .field("gateway_oauth_url", &self.gateway_oauth_url)
            .field("gateway_api_url", &self.gateway_api_url)
            .field("gateway_model", &self.gateway_model)
            .field("gateway_tls", &self.gateway_tls)
            .field("gateway_token_timeout", &self.gateway_token_timeout)
            .field("gateway_completion_timeout", &self.gateway_completion_timeout)
            .field("summary_batch_limit", &self.summary_batch_limit)
            .field("summary_min_length", &self.summary_min_length)
            .field("summary_system_prompt", &self.summary_system_prompt)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        telegram_bot_token: "test".to_string(),
        telegram_api_url: "http://localhost".to_string(),
        database_url: ":memory:".to_string(),
        self_identity: None,
        monitor_peer: None,
        backfill_limit: 100,
        connect_retry_delay: Duration::from_millis(1),
        gateway_client_id: Some("client".to_string()),
        gateway_client_secret: Some("secret".to_string()),
        gateway_scope: "GIGACHAT_API_PERS".to_string(),
        gateway_oauth_url: "http://localhost/oauth".to_string(),
        gateway_api_url: "http://localhost/api/v1".to_string(),
        gateway_model: "GigaChat".to_string(),
        gateway_tls: TlsVerification::Enabled,
        gateway_token_timeout: Duration::from_secs(5),
        gateway_completion_timeout: Duration::from_secs(5),
        summary_batch_limit: 100,
        summary_min_length: 10,
        summary_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
    }
}
