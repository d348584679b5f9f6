use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A worker host. Registered and heartbeaten by the node agent running on it;
/// VM addresses are carved out of `ip_range`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Server {
    pub id: Uuid,
    pub region_id: Uuid,
    pub hostname: String,
    pub internal_ip: IpNetwork,
    pub ip_range: IpNetwork,
    pub status: ServerStatus,
    pub vcpus: i32,
    pub memory_mb: i32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
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
#[sqlx(type_name = "server_status", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Draining,
    Drained,
    Dead,
}

/// Deployments and servers are region-scoped; regions are independent of each
/// other.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Region {
    pub id: Uuid,
    pub code: String,
    pub country: String,
    pub city: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}
