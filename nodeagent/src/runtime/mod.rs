//! The narrow contract the agent speaks to whichever backend runs workloads
//! on this host.

pub mod docker;
pub mod firecracker;

use std::collections::HashMap;
use std::net::IpAddr;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

/// Label every runtime object carries so `list` can tell ours apart from
/// anything else running on the host.
pub const INSTANCE_ID_LABEL: &str = "zeitwork.instance.id";
pub const MANAGED_LABEL: &str = "zeitwork.managed";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("instance {0} was not found in the runtime")]
    NotFound(Uuid),
    #[error("the runtime rejected the request: {0}")]
    Rejected(String),
    #[error("instance is missing required field: {0}")]
    InvalidSpec(&'static str),
}

/// Everything a backend needs to bring one instance up.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub id: Uuid,
    /// Pullable image reference (docker mode).
    pub image: String,
    /// Key of the prebuilt root filesystem (firecracker mode).
    pub disk_image_key: Option<String>,
    pub ip: Option<IpAddr>,
    pub vcpus: i32,
    pub memory_mb: i32,
    pub port: u16,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Exited,
    Unknown,
}

/// One instance as the runtime sees it.
#[derive(Debug, Clone)]
pub struct RuntimeInstance {
    pub runtime_id: String,
    pub instance_id: Uuid,
    pub image: String,
    pub state: InstanceState,
    pub ip: Option<IpAddr>,
}

pub type LogLines = Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>;

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create and start an instance. Idempotent: starting an instance that is
    /// already running is a no-op.
    async fn start(&self, spec: &InstanceSpec) -> Result<(), RuntimeError>;

    /// Stop (and clean up) an instance. Stopping an unknown instance is a
    /// no-op.
    async fn stop(&self, instance_id: Uuid) -> Result<(), RuntimeError>;

    /// Every instance on this host carrying our labels.
    async fn list(&self) -> Result<Vec<RuntimeInstance>, RuntimeError>;

    async fn status(&self, instance_id: Uuid) -> Result<Option<RuntimeInstance>, RuntimeError>;

    /// Stdout/stderr of an instance, line by line. With `follow`, the stream
    /// stays open and yields lines as they appear.
    async fn logs(&self, instance_id: Uuid, follow: bool) -> Result<LogLines, RuntimeError>;

    /// Release backend resources at shutdown. Running instances are left
    /// alone; they belong to the host, not to this process.
    async fn close(&self) -> Result<(), RuntimeError>;
}
