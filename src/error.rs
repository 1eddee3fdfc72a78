//! Error types shared across the capture and summarization pipeline.

use thiserror::Error;

/// Failures of the upstream conversation stream.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to connect to event source: {0}")]
    Connect(String),

    #[error("event source transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("event source rejected request: {0}")]
    Rejected(String),

    #[error("failed to decode event: {0}")]
    Decode(String),
}

/// The ledger could not be read or written.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error("blocking database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Client-facing gateway failure. Callers treat every cause the same way:
/// the batch stays pending and can be retried later.
#[derive(Debug, Error)]
#[error("summarization gateway unavailable")]
pub struct GatewayError {
    #[source]
    pub cause: GatewayFailure,
}

impl From<GatewayFailure> for GatewayError {
    fn from(cause: GatewayFailure) -> Self {
        Self { cause }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayFailure::Transport(err).into()
    }
}

/// Underlying reason a gateway call failed, kept for logs.
#[derive(Debug, Error)]
pub enum GatewayFailure {
    #[error("gateway client id or secret is not configured")]
    MissingCredentials,

    #[error("token exchange returned status {status}: {body}")]
    TokenStatus { status: u16, body: String },

    #[error("token exchange response has no access_token")]
    MissingToken,

    #[error("completion returned status {status}: {body}")]
    CompletionStatus { status: u16, body: String },

    #[error("completion response has no choices[0].message.content")]
    ResponseShape,

    #[error("failed to load CA bundle {path}: {reason}")]
    Tls { path: String, reason: String },

    #[error("gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Startup configuration is missing or malformed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Why a summarization run did not complete.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
