use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A hostname routed by the edge.
///
/// Routable iff `verified_at` and `deployment_id` are both set and the
/// deployment's VM is running; otherwise the edge answers 404. Ownership is
/// proven by a DNS TXT record at the name derived in
/// [`crate::verification::verification_record_name`] containing
/// `verification_token`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Domain {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Option<Uuid>,
    pub deployment_id: Option<Uuid>,
    pub name: String,
    pub verification_token: String,
    pub txt_verification_required: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Domain {
    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some() || !self.txt_verification_required
    }
}
