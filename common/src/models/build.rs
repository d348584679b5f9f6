use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A materialization of a commit into a container image. Executed by an
/// external builder worker which claims rows via the `images.building_by`
/// lease.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Build {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub github_commit: String,
    pub github_branch: String,
    pub status: BuildStatus,
    pub image_id: Option<Uuid>,
    pub vm_id: Option<Uuid>,
    pub pending_at: DateTime<Utc>,
    pub building_at: Option<DateTime<Utc>>,
    pub successful_at: Option<DateTime<Utc>>,
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
#[sqlx(type_name = "build_status", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Building,
    Successful,
    Failed,
}

/// A container image reference. `(registry, repository, tag)` is unique;
/// `building_by` holds a builder lease which goes stale after ten minutes.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Image {
    pub id: Uuid,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
    pub disk_image_key: Option<String>,
    pub building_by: Option<Uuid>,
    pub building_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Image {
    /// Full pullable reference, e.g. `registry.example.com/acme/web:abc123`.
    pub fn reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_reference_includes_registry_and_tag() {
        let image = Image {
            id: Uuid::from_u128(1),
            registry: "registry.example.com".into(),
            repository: "acme/web".into(),
            tag: "4f2a9c1".into(),
            digest: None,
            disk_image_key: None,
            building_by: None,
            building_started_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };

        assert_eq!(image.reference(), "registry.example.com/acme/web:4f2a9c1");
    }
}
