use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::args::Args;
use crate::{builds, deployments, domains, pool, supersession, Result};

/// One advisory-lock key shared by every reconciler replica ("zeitwork" in
/// ascii). Whoever holds it performs the cycle; everyone else skips.
const RECONCILER_LOCK_KEY: i64 = 0x7a65_6974_776f_726b;

/// Hard deadline for one cycle; a wedged sweep must not block the lock
/// forever.
const CYCLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
    pub build_timeout: Duration,
    pub startup_timeout: Duration,
    pub grace_period: chrono::Duration,
    pub pool_size: u32,
    pub pool_vm_vcpus: i32,
    pub pool_vm_memory_mb: i32,
    pub workload_port: i32,
}

impl From<&Args> for ReconcileConfig {
    fn from(args: &Args) -> Self {
        Self {
            interval: Duration::from_secs(args.interval_secs),
            build_timeout: Duration::from_secs(args.build_timeout_secs),
            startup_timeout: Duration::from_secs(args.startup_timeout_secs),
            grace_period: chrono::Duration::seconds(args.grace_period_secs as i64),
            pool_size: args.pool_size,
            pool_vm_vcpus: args.pool_vm_vcpus,
            pool_vm_memory_mb: args.pool_vm_memory_mb,
            workload_port: args.workload_port,
        }
    }
}

pub struct Reconciler {
    pool: PgPool,
    resolver: TokioAsyncResolver,
    config: ReconcileConfig,
    region_id: Uuid,
}

impl Reconciler {
    pub async fn init(args: &Args) -> Result<Self> {
        let pool = zeitwork_common::db::connect_and_migrate(&args.database_url).await?;

        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(error) => {
                warn!(%error, "no usable system resolver config, using defaults");
                TokioAsyncResolver::tokio(Default::default(), Default::default())
            }
        };

        let region_id = pool::ensure_region(&pool, &args.region_code).await?;

        Ok(Self {
            pool,
            resolver,
            config: ReconcileConfig::from(args),
            region_id,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn region_id(&self) -> Uuid {
        self.region_id
    }

    /// Tick until shutdown. Each tick tries the advisory lock; if another
    /// replica holds it this one stays a warm standby.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(region = %self.region_id, "reconciler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reconciler stopping");
                    return;
                }
                _ = zeitwork_common::ticker::sleep_jittered(self.config.interval) => {}
            }

            match tokio::time::timeout(CYCLE_TIMEOUT, self.cycle()).await {
                Ok(Ok(changed)) if changed > 0 => {
                    info!(changed, "reconciliation cycle made progress");
                }
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    warn!(
                        error = &error as &dyn std::error::Error,
                        "reconciliation cycle failed, retrying next tick"
                    );
                }
                Err(_) => {
                    error!("reconciliation cycle exceeded its deadline");
                }
            }
        }
    }

    /// One guarded cycle. Returns the number of rows changed; a second run
    /// against unchanged state reports zero.
    pub async fn cycle(&self) -> Result<usize> {
        // The lock is session-scoped, so it must be taken and released on one
        // dedicated connection, not through the pool at large.
        let mut lock_conn = self.pool.acquire().await?;

        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(RECONCILER_LOCK_KEY)
            .fetch_one(&mut *lock_conn)
            .await?;
        if !locked {
            debug!("another replica is reconciling, skipping this cycle");
            return Ok(0);
        }

        let swept = self.sweep().await;

        let unlock = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(RECONCILER_LOCK_KEY)
            .execute(&mut *lock_conn)
            .await;
        if let Err(error) = unlock {
            // The lock dies with the connection, so dropping it is enough.
            warn!(
                error = &error as &dyn std::error::Error,
                "failed to release the reconciler lock, dropping the connection"
            );
        }

        swept
    }

    /// The sweep itself: read-mostly, with targeted preconditioned writes.
    /// A failing step is logged and skipped; every step is self-healing on
    /// the next cycle.
    async fn sweep(&self) -> Result<usize> {
        let mut changed = 0;

        changed += self
            .step("verify_domains", domains::verify_domains(&self.pool, &self.resolver))
            .await;
        changed += self
            .step(
                "fail_timed_out_builds",
                builds::fail_timed_out_builds(&self.pool, self.config.build_timeout),
            )
            .await;
        changed += self
            .step(
                "reclaim_stale_image_leases",
                builds::reclaim_stale_image_leases(&self.pool),
            )
            .await;
        changed += self
            .step("start_pending", deployments::start_pending(&self.pool))
            .await;
        changed += self
            .step(
                "progress_building",
                deployments::progress_building(&self.pool, self.region_id, self.config.workload_port),
            )
            .await;
        changed += self
            .step(
                "progress_starting",
                deployments::progress_starting(&self.pool, self.config.startup_timeout),
            )
            .await;
        changed += self
            .step(
                "demote_superseded",
                supersession::demote_superseded(&self.pool, self.config.grace_period),
            )
            .await;
        changed += self
            .step("release_vms", deployments::release_vms(&self.pool))
            .await;
        changed += self
            .step(
                "maintain_pool",
                pool::maintain_pool(&self.pool, self.region_id, &self.config),
            )
            .await;

        Ok(changed)
    }

    async fn step(
        &self,
        name: &'static str,
        work: impl std::future::Future<Output = Result<usize>>,
    ) -> usize {
        match work.await {
            Ok(changed) => {
                if changed > 0 {
                    debug!(step = name, changed, "step made progress");
                }
                changed
            }
            Err(error) => {
                warn!(
                    step = name,
                    error = &error as &dyn std::error::Error,
                    "step failed, continuing the sweep"
                );
                0
            }
        }
    }
}
