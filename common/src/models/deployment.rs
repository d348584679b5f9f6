use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A versioned attempt to run a given commit for a project + environment.
///
/// Timestamps only ever move forward along the transitions taken; the
/// reconciler never rewrites a deployment to an earlier state.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub github_commit: String,
    pub status: DeploymentStatus,
    pub build_id: Option<Uuid>,
    pub image_id: Option<Uuid>,
    pub vm_id: Option<Uuid>,
    pub pending_at: DateTime<Utc>,
    pub building_at: Option<DateTime<Utc>>,
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
#[sqlx(type_name = "deployment_status", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Starting,
    Running,
    Inactive,
    Stopping,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    /// States that still hold (or may come to hold) a VM.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Inactive | Self::Stopped | Self::Failed)
    }

    /// States counted against the per-organisation fairness limit.
    pub fn is_progressing(&self) -> bool {
        matches!(self, Self::Building | Self::Starting)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn status_strings_match_the_database_enum() {
        assert_eq!(DeploymentStatus::Pending.to_string(), "pending");
        assert_eq!(DeploymentStatus::Inactive.to_string(), "inactive");
        assert_eq!(
            DeploymentStatus::from_str("running").unwrap(),
            DeploymentStatus::Running
        );
    }

    #[test]
    fn live_and_progressing_sets() {
        assert!(DeploymentStatus::Running.is_live());
        assert!(DeploymentStatus::Stopping.is_live());
        assert!(!DeploymentStatus::Inactive.is_live());
        assert!(!DeploymentStatus::Failed.is_live());

        assert!(DeploymentStatus::Building.is_progressing());
        assert!(DeploymentStatus::Starting.is_progressing());
        assert!(!DeploymentStatus::Running.is_progressing());
        assert!(!DeploymentStatus::Pending.is_progressing());
    }
}
