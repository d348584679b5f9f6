pub mod acme;
pub mod args;
pub mod issuer;
pub mod proxy;
pub mod routes;
pub mod storage;
pub mod tls;

#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("acme error: {0}")]
    Acme(#[from] acme::AcmeClientError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed stored data: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, EdgeError>;
