use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Organisation {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A deployable Git repository. Written by the external API; the control
/// plane only reads it.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub slug: String,
    pub github_repository: String,
    pub github_installation_id: i64,
    pub root_directory: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A named slot within a project (`production`, `staging`, …); at most one
/// running deployment per environment at any instant.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Environment {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// `value` is AES-256-GCM encrypted, see [`crate::secrets::SecretCipher`].
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct EnvironmentVariable {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Option<Uuid>,
    pub name: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}
