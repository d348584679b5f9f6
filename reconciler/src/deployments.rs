//! The deployment state machine.
//!
//! ```text
//! pending ──► building ──► starting ──► running ──► inactive
//!                  │            │           │
//!                  └─► failed ◄─┴───────────┘
//! ```
//!
//! Every transition is a single UPDATE whose WHERE clause re-checks the
//! expected current status, so a transition raced by the manager or another
//! replica simply affects zero rows and the next cycle re-evaluates.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeitwork_common::ids::new_id;
use zeitwork_common::models::{BuildStatus, VmStatus};

use crate::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
struct PendingDeployment {
    id: Uuid,
    organisation_id: Uuid,
    project_id: Uuid,
    github_commit: String,
}

/// Fairness: one deployment may start building per organisation per cycle,
/// and only for organisations that do not already own a deployment in
/// `building` or `starting`. Candidates are visited in id order so the oldest
/// pending deployment of an organisation goes first.
fn eligible_pending(candidates: &[(Uuid, Uuid)], busy_organisations: &HashSet<Uuid>) -> Vec<Uuid> {
    let mut busy = busy_organisations.clone();
    let mut eligible = Vec::new();
    for (deployment, organisation) in candidates {
        if busy.insert(*organisation) {
            eligible.push(*deployment);
        }
    }
    eligible
}

/// pending → building: create the build row and attach it.
pub async fn start_pending(pool: &PgPool) -> Result<usize> {
    let pending: Vec<PendingDeployment> = sqlx::query_as(
        "SELECT id, organisation_id, project_id, github_commit
         FROM deployments
         WHERE status = 'pending' AND deleted_at IS NULL
         ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    if pending.is_empty() {
        return Ok(0);
    }

    let busy: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT DISTINCT organisation_id FROM deployments
         WHERE status IN ('building', 'starting') AND deleted_at IS NULL",
    )
    .fetch_all(pool)
    .await?;
    let busy: HashSet<Uuid> = busy.into_iter().map(|(id,)| id).collect();

    let by_id: HashMap<Uuid, &PendingDeployment> =
        pending.iter().map(|d| (d.id, d)).collect();
    let candidates: Vec<(Uuid, Uuid)> = pending
        .iter()
        .map(|d| (d.id, d.organisation_id))
        .collect();

    let mut started = 0;
    for id in eligible_pending(&candidates, &busy) {
        let deployment = by_id[&id];
        let build_id = new_id();

        let mut tx = pool.begin().await?;
        sqlx::query(
            "INSERT INTO builds (id, organisation_id, project_id, github_commit)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(build_id)
        .bind(deployment.organisation_id)
        .bind(deployment.project_id)
        .bind(&deployment.github_commit)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE deployments
             SET build_id = $1, status = 'building', building_at = now(), updated_at = now()
             WHERE id = $2 AND status = 'pending'",
        )
        .bind(build_id)
        .bind(deployment.id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 1 {
            tx.commit().await?;
            info!(deployment = %deployment.id, build = %build_id, "deployment is building");
            started += 1;
        } else {
            tx.rollback().await?;
            debug!(deployment = %deployment.id, "no longer pending, skipping");
        }
    }

    Ok(started)
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BuildingDeployment {
    id: Uuid,
    project_id: Uuid,
    environment_id: Uuid,
    build_status: BuildStatus,
    build_image_id: Option<Uuid>,
}

/// building → starting (claim a pool VM) or building → failed.
pub async fn progress_building(
    pool: &PgPool,
    region_id: Uuid,
    workload_port: i32,
) -> Result<usize> {
    let building: Vec<BuildingDeployment> = sqlx::query_as(
        "SELECT d.id, d.project_id, d.environment_id,
                b.status AS build_status, b.image_id AS build_image_id
         FROM deployments d
         JOIN builds b ON b.id = d.build_id
         WHERE d.status = 'building' AND d.deleted_at IS NULL
         ORDER BY d.id",
    )
    .fetch_all(pool)
    .await?;

    let mut changed = 0;
    for deployment in building {
        match deployment.build_status {
            BuildStatus::Failed => {
                let result = sqlx::query(
                    "UPDATE deployments
                     SET status = 'failed', failed_at = now(), updated_at = now()
                     WHERE id = $1 AND status = 'building'",
                )
                .bind(deployment.id)
                .execute(pool)
                .await?;
                if result.rows_affected() == 1 {
                    warn!(deployment = %deployment.id, "build failed, deployment failed");
                    changed += 1;
                }
            }
            BuildStatus::Successful => {
                let Some(image_id) = deployment.build_image_id else {
                    warn!(
                        deployment = %deployment.id,
                        "build is successful but has no image, leaving untouched"
                    );
                    continue;
                };
                if claim_pool_vm(pool, &deployment, image_id, region_id, workload_port).await? {
                    changed += 1;
                }
            }
            BuildStatus::Pending | BuildStatus::Building => {}
        }
    }

    Ok(changed)
}

/// Claim one warm VM for a deployment whose image is ready. Runs in a
/// transaction with `FOR UPDATE SKIP LOCKED` so concurrent claimants never
/// pick the same VM. Returns false when the pool is empty; the next cycle
/// retries after pool maintenance has refilled it.
async fn claim_pool_vm(
    pool: &PgPool,
    deployment: &BuildingDeployment,
    image_id: Uuid,
    region_id: Uuid,
    workload_port: i32,
) -> Result<bool> {
    let env: Vec<(String, String)> = sqlx::query_as(
        "SELECT name, value FROM environment_variables
         WHERE project_id = $1 AND deleted_at IS NULL
           AND (environment_id IS NULL OR environment_id = $2)",
    )
    .bind(deployment.project_id)
    .bind(deployment.environment_id)
    .fetch_all(pool)
    .await?;
    let env: HashMap<String, String> = env.into_iter().collect();

    let mut tx = pool.begin().await?;

    let vm: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM vms
         WHERE status = 'pooling' AND region_id = $1
           AND server_id IS NOT NULL AND deleted_at IS NULL
         ORDER BY id
         LIMIT 1
         FOR UPDATE SKIP LOCKED",
    )
    .bind(region_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((vm_id,)) = vm else {
        tx.rollback().await?;
        debug!(deployment = %deployment.id, "no pool vm available yet");
        return Ok(false);
    };

    let vm_updated = sqlx::query(
        "UPDATE vms
         SET image_id = $1, env_variables = $2, port = $3,
             status = 'pending', pending_at = now(), updated_at = now()
         WHERE id = $4 AND status = 'pooling'",
    )
    .bind(image_id)
    .bind(Json(&env))
    .bind(workload_port)
    .bind(vm_id)
    .execute(&mut *tx)
    .await?;

    let deployment_updated = sqlx::query(
        "UPDATE deployments
         SET image_id = $1, vm_id = $2, status = 'starting',
             starting_at = now(), updated_at = now()
         WHERE id = $3 AND status = 'building'",
    )
    .bind(image_id)
    .bind(vm_id)
    .bind(deployment.id)
    .execute(&mut *tx)
    .await?;

    if vm_updated.rows_affected() == 1 && deployment_updated.rows_affected() == 1 {
        tx.commit().await?;
        info!(deployment = %deployment.id, vm = %vm_id, "deployment is starting");
        Ok(true)
    } else {
        tx.rollback().await?;
        debug!(deployment = %deployment.id, "claim lost a race, skipping");
        Ok(false)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StartingDeployment {
    id: Uuid,
    project_id: Uuid,
    environment_id: Uuid,
    vm_status: VmStatus,
    timed_out: bool,
}

/// starting → running (VM came up), starting → failed (VM failed or the
/// startup timeout elapsed). Promotion also repoints the project's domains
/// at the new deployment.
pub async fn progress_starting(pool: &PgPool, startup_timeout: Duration) -> Result<usize> {
    let starting: Vec<StartingDeployment> = sqlx::query_as(
        "SELECT d.id, d.project_id, d.environment_id,
                v.status AS vm_status,
                COALESCE(d.starting_at <= now() - ($1 * interval '1 second'), false) AS timed_out
         FROM deployments d
         JOIN vms v ON v.id = d.vm_id
         WHERE d.status = 'starting' AND d.deleted_at IS NULL
         ORDER BY d.id",
    )
    .bind(startup_timeout.as_secs() as i64)
    .fetch_all(pool)
    .await?;

    let mut changed = 0;
    for deployment in starting {
        match deployment.vm_status {
            VmStatus::Running => {
                let result = sqlx::query(
                    "UPDATE deployments
                     SET status = 'running', running_at = now(), updated_at = now()
                     WHERE id = $1 AND status = 'starting'",
                )
                .bind(deployment.id)
                .execute(pool)
                .await?;
                if result.rows_affected() != 1 {
                    continue;
                }

                let repointed = sqlx::query(
                    "UPDATE domains
                     SET deployment_id = $1, updated_at = now()
                     WHERE project_id = $2 AND deleted_at IS NULL
                       AND (environment_id = $3 OR environment_id IS NULL)
                       AND deployment_id IS DISTINCT FROM $1",
                )
                .bind(deployment.id)
                .bind(deployment.project_id)
                .bind(deployment.environment_id)
                .execute(pool)
                .await?;

                info!(
                    deployment = %deployment.id,
                    domains = repointed.rows_affected(),
                    "deployment is running"
                );
                changed += 1;
            }
            VmStatus::Failed => {
                changed += fail_starting(pool, deployment.id, "vm failed").await?;
            }
            _ if deployment.timed_out => {
                changed += fail_starting(pool, deployment.id, "startup timed out").await?;
            }
            _ => {}
        }
    }

    Ok(changed)
}

async fn fail_starting(pool: &PgPool, id: Uuid, reason: &str) -> Result<usize> {
    let result = sqlx::query(
        "UPDATE deployments
         SET status = 'failed', failed_at = now(), updated_at = now()
         WHERE id = $1 AND status = 'starting'",
    )
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        warn!(deployment = %id, reason, "deployment failed");
        Ok(1)
    } else {
        Ok(0)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ReleasableDeployment {
    id: Uuid,
    status: String,
    vm_id: Uuid,
    vm_status: VmStatus,
}

/// Deployments that are done with their VM (`failed`, `inactive`, `stopped`,
/// or an API-requested `stopping`) hand it back: the VM is marked `stopping`
/// for the node agent, and once it is down the deployment lets go of it.
/// Pool maintenance later decides between recycling and deletion.
pub async fn release_vms(pool: &PgPool) -> Result<usize> {
    let releasable: Vec<ReleasableDeployment> = sqlx::query_as(
        "SELECT d.id, d.status::text AS status, d.vm_id, v.status AS vm_status
         FROM deployments d
         JOIN vms v ON v.id = d.vm_id
         WHERE d.status IN ('failed', 'inactive', 'stopped', 'stopping')
           AND d.deleted_at IS NULL
         ORDER BY d.id",
    )
    .fetch_all(pool)
    .await?;

    let mut changed = 0;
    for deployment in releasable {
        match deployment.vm_status {
            VmStatus::Pending | VmStatus::Pooling | VmStatus::Starting | VmStatus::Running => {
                let result = sqlx::query(
                    "UPDATE vms
                     SET status = 'stopping', stopping_at = now(), updated_at = now()
                     WHERE id = $1 AND status IN ('pending', 'pooling', 'starting', 'running')",
                )
                .bind(deployment.vm_id)
                .execute(pool)
                .await?;
                if result.rows_affected() == 1 {
                    info!(vm = %deployment.vm_id, deployment = %deployment.id, "vm released");
                    changed += 1;
                }
            }
            VmStatus::Stopping => {}
            VmStatus::Stopped | VmStatus::Failed => {
                // VM is down; finish an API-requested stop and detach.
                if deployment.status == "stopping" {
                    let result = sqlx::query(
                        "UPDATE deployments
                         SET status = 'stopped', stopped_at = now(), vm_id = NULL,
                             updated_at = now()
                         WHERE id = $1 AND status = 'stopping'",
                    )
                    .bind(deployment.id)
                    .execute(pool)
                    .await?;
                    changed += result.rows_affected() as usize;
                } else {
                    let result = sqlx::query(
                        "UPDATE deployments SET vm_id = NULL, updated_at = now()
                         WHERE id = $1 AND vm_id = $2",
                    )
                    .bind(deployment.id)
                    .bind(deployment.vm_id)
                    .execute(pool)
                    .await?;
                    changed += result.rows_affected() as usize;
                }
            }
        }
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn busy_organisations_are_skipped() {
        let candidates = vec![(uuid(1), uuid(10)), (uuid(2), uuid(20))];
        let busy: HashSet<Uuid> = [uuid(10)].into();

        assert_eq!(eligible_pending(&candidates, &busy), vec![uuid(2)]);
    }

    #[test]
    fn one_start_per_organisation_per_cycle() {
        let candidates = vec![
            (uuid(1), uuid(10)),
            (uuid(2), uuid(10)),
            (uuid(3), uuid(20)),
        ];

        assert_eq!(
            eligible_pending(&candidates, &HashSet::new()),
            vec![uuid(1), uuid(3)]
        );
    }

    #[test]
    fn oldest_deployment_of_an_organisation_goes_first() {
        // candidates arrive in id order; the first (oldest) one wins
        let candidates = vec![(uuid(5), uuid(10)), (uuid(9), uuid(10))];

        assert_eq!(eligible_pending(&candidates, &HashSet::new()), vec![uuid(5)]);
    }

    #[test]
    fn empty_input_starts_nothing() {
        assert!(eligible_pending(&[], &HashSet::new()).is_empty());
    }
}
