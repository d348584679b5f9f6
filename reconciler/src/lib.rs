pub mod args;
pub mod builds;
pub mod deployments;
pub mod domains;
pub mod pool;
pub mod service;
pub mod supersession;

pub use service::{ReconcileConfig, Reconciler};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
