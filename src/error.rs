use std::time::Duration;

use thiserror::Error;

/// Failures talking to the upstream market data source.
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("stream connection failed: {0}")]
    Stream(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl MarketDataError {
    pub fn malformed(what: impl Into<String>) -> Self {
        MarketDataError::Malformed(what.into())
    }
}

/// Process configuration problems. These are the only errors that stop startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing mandatory environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings document must be a JSON object")]
    NotAnObject,

    #[error("invalid settings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{key} out of range: {value}")]
    OutOfRange { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("document encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stored settings rejected: {0}")]
    Settings(#[from] SettingsError),
}

/// Reasons a dashboard request was refused. The coordinator state is
/// unchanged whenever one of these is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("no open trade with id {0}")]
    UnknownTrade(u64),

    #[error("settings rejected: {0}")]
    InvalidSettings(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("bot is shutting down")]
    ShuttingDown,
}
