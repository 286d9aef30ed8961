use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("SPAWN_FAILED: {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("CANCELLED: {0}")]
    Cancelled(String),
    #[error("TIMEOUT: {id} exceeded {limit:?}")]
    Timeout { id: String, limit: Duration },
    #[error("PROTOCOL_ERROR: {0}")]
    Protocol(String),
    #[error("CHILD_TERMINATED: exit code {0}")]
    ChildTerminated(i32),
    #[error("REGISTRY_MISUSE: {0}")]
    Registry(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("PARSE_FAILURE: {0}")]
    Parse(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task failed: {}", value))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", value))
    }
}

pub type AppResult<T> = Result<T, AppError>;
