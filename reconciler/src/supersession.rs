//! Blue/green replacement: within each (project, environment), the newest
//! running deployment wins, the previous one keeps serving through a grace
//! window, and everything older is demoted immediately.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunningDeployment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub environment_id: Uuid,
    pub running_at: Option<DateTime<Utc>>,
}

/// Which running deployments should become `inactive` right now.
///
/// Ids are time-sortable, so within a group the maximum id is the latest
/// deployment. The latest always stays. The runner-up stays only while the
/// latest has been running for less than `grace`; deployments older than the
/// runner-up are demoted with no grace at all, which bounds how many old VMs
/// can linger.
pub fn plan_demotions(
    running: &[RunningDeployment],
    now: DateTime<Utc>,
    grace: Duration,
) -> Vec<Uuid> {
    let mut groups: HashMap<(Uuid, Uuid), Vec<&RunningDeployment>> = HashMap::new();
    for deployment in running {
        groups
            .entry((deployment.project_id, deployment.environment_id))
            .or_default()
            .push(deployment);
    }

    let mut demote = Vec::new();
    for group in groups.values_mut() {
        group.sort_by(|a, b| b.id.cmp(&a.id));

        let latest = group[0];
        for (position, deployment) in group.iter().enumerate().skip(1) {
            if position == 1 {
                let grace_over = latest
                    .running_at
                    .map(|t| now - t >= grace)
                    .unwrap_or(false);
                if grace_over {
                    demote.push(deployment.id);
                }
            } else {
                demote.push(deployment.id);
            }
        }
    }

    demote.sort();
    demote
}

/// Apply the plan. Each demotion is preconditioned on the row still being
/// `running`; losing that race just means the next cycle re-plans.
pub async fn demote_superseded(pool: &PgPool, grace: Duration) -> Result<usize> {
    let running: Vec<RunningDeployment> = sqlx::query_as(
        "SELECT id, project_id, environment_id, running_at
         FROM deployments
         WHERE status = 'running' AND deleted_at IS NULL",
    )
    .fetch_all(pool)
    .await?;

    let mut demoted = 0;
    for id in plan_demotions(&running, Utc::now(), grace) {
        let result = sqlx::query(
            "UPDATE deployments
             SET status = 'inactive', updated_at = now()
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 1 {
            info!(deployment = %id, "superseded deployment demoted");
            demoted += 1;
        } else {
            debug!(deployment = %id, "demotion lost a race, skipping");
        }
    }

    Ok(demoted)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn deployment(
        id: u128,
        project: u128,
        environment: u128,
        running_at: Option<DateTime<Utc>>,
    ) -> RunningDeployment {
        RunningDeployment {
            id: Uuid::from_u128(id),
            project_id: Uuid::from_u128(project),
            environment_id: Uuid::from_u128(environment),
            running_at,
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    const GRACE: i64 = 300;

    #[test]
    fn single_running_deployment_is_kept() {
        let running = vec![deployment(1, 1, 1, Some(at(0)))];
        assert!(plan_demotions(&running, at(10_000), Duration::seconds(GRACE)).is_empty());
    }

    #[test]
    fn runner_up_survives_inside_the_grace_window() {
        let running = vec![
            deployment(1, 1, 1, Some(at(0))),
            deployment(2, 1, 1, Some(at(100))),
        ];

        // one second before the window closes
        let now = at(100 + GRACE - 1);
        assert!(plan_demotions(&running, now, Duration::seconds(GRACE)).is_empty());
    }

    #[test]
    fn runner_up_is_demoted_after_the_grace_window() {
        let running = vec![
            deployment(1, 1, 1, Some(at(0))),
            deployment(2, 1, 1, Some(at(100))),
        ];

        let now = at(100 + GRACE + 1);
        assert_eq!(
            plan_demotions(&running, now, Duration::seconds(GRACE)),
            vec![Uuid::from_u128(1)]
        );
    }

    #[test]
    fn grace_boundary_is_inclusive() {
        let running = vec![
            deployment(1, 1, 1, Some(at(0))),
            deployment(2, 1, 1, Some(at(100))),
        ];

        let now = at(100 + GRACE);
        assert_eq!(
            plan_demotions(&running, now, Duration::seconds(GRACE)),
            vec![Uuid::from_u128(1)]
        );
    }

    #[test]
    fn older_than_runner_up_is_demoted_immediately() {
        let running = vec![
            deployment(1, 1, 1, Some(at(0))),
            deployment(2, 1, 1, Some(at(50))),
            deployment(3, 1, 1, Some(at(100))),
        ];

        // latest is brand new: the runner-up (2) keeps its grace, but 1 goes
        let now = at(101);
        assert_eq!(
            plan_demotions(&running, now, Duration::seconds(GRACE)),
            vec![Uuid::from_u128(1)]
        );
    }

    #[test]
    fn groups_are_independent() {
        let running = vec![
            deployment(1, 1, 1, Some(at(0))),
            deployment(2, 1, 1, Some(at(10_000))),
            deployment(3, 2, 1, Some(at(0))),
            deployment(4, 1, 2, Some(at(0))),
        ];

        let now = at(10_000 + GRACE);
        assert_eq!(
            plan_demotions(&running, now, Duration::seconds(GRACE)),
            vec![Uuid::from_u128(1)]
        );
    }

    #[test]
    fn latest_without_running_at_grants_grace() {
        // observed mid-transition: the promote committed but running_at is
        // still null in this read. Keep the runner-up.
        let running = vec![
            deployment(1, 1, 1, Some(at(0))),
            deployment(2, 1, 1, None),
        ];

        assert!(plan_demotions(&running, at(10_000), Duration::seconds(GRACE)).is_empty());
    }

    #[test]
    fn planning_is_idempotent() {
        let running = vec![
            deployment(1, 1, 1, Some(at(0))),
            deployment(2, 1, 1, Some(at(50))),
            deployment(3, 1, 1, Some(at(100))),
        ];
        let now = at(100 + GRACE + 10);

        let first = plan_demotions(&running, now, Duration::seconds(GRACE));
        let second = plan_demotions(&running, now, Duration::seconds(GRACE));
        assert_eq!(first, second);
        assert_eq!(first, vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
    }
}
