use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

/// A running unit (container or micro-VM) serving at most one deployment.
///
/// Pool VMs (`status = pooling`) have no image yet; claiming one sets
/// `image_id` and `env_variables` and moves it to `starting`. Values in
/// `env_variables` stay encrypted at rest; the node agent decrypts them just
/// before handing them to the runtime.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Vm {
    pub id: Uuid,
    pub region_id: Uuid,
    pub server_id: Option<Uuid>,
    pub image_id: Option<Uuid>,
    pub status: VmStatus,
    pub vcpus: i32,
    pub memory_mb: i32,
    pub port: Option<i32>,
    pub ip_address: Option<IpNetwork>,
    pub env_variables: Json<HashMap<String, String>>,
    pub metadata: Json<serde_json::Value>,
    pub pending_at: DateTime<Utc>,
    pub starting_at: Option<DateTime<Utc>>,
    pub running_at: Option<DateTime<Utc>>,
    pub stopping_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[sqlx(type_name = "vm_status", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Pending,
    Pooling,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl VmStatus {
    /// States the node agent has to act on or keep alive.
    pub fn is_desired_on_node(&self) -> bool {
        matches!(self, Self::Pending | Self::Starting | Self::Running | Self::Stopping)
    }
}

/// Append-only stdout/stderr line captured from a running instance.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct VmLog {
    pub id: Uuid,
    pub vm_id: Uuid,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_agent_desired_set() {
        assert!(VmStatus::Pending.is_desired_on_node());
        assert!(VmStatus::Stopping.is_desired_on_node());
        assert!(!VmStatus::Pooling.is_desired_on_node());
        assert!(!VmStatus::Stopped.is_desired_on_node());
        assert!(!VmStatus::Failed.is_desired_on_node());
    }
}
