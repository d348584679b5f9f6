pub mod args;
pub mod connection;
pub mod pgoutput;
pub mod stream;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("bus error: {0}")]
    Bus(#[from] zeitwork_common::events::BusError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("replication decode error: {0}")]
    Decode(#[from] pgoutput::DecodeError),
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },
}
