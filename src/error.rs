//! Error types for the telemetry agent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
