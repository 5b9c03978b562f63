use thiserror::Error;

/// Failures talking to Home Assistant (state reads, service calls)
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("service call {service} failed: {reason}")]
    ServiceCallFailed { service: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that abort a tick's decision computation
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("cannot resolve local time {0}")]
    LocalTime(String),
}
