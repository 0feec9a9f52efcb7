//! Crate-wide error types.

use thiserror::Error;

pub type PerfscopeResult<T> = Result<T, PerfscopeError>;

#[derive(Debug, Error)]
pub enum PerfscopeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("profiler error: {0}")]
    Profiler(String),

    #[error("report error: {0}")]
    Report(String),
}
