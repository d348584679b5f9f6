pub mod agent;
pub mod args;
pub mod logs;
pub mod runtime;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("runtime error: {0}")]
    Runtime(#[from] runtime::RuntimeError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("secrets error: {0}")]
    Secrets(#[from] zeitwork_common::secrets::SecretsError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
