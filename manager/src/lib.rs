pub mod args;

use std::time::Duration;

use futures::stream::SelectAll;
use futures::StreamExt;
use hickory_resolver::TokioAsyncResolver;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeitwork_common::events::Bus;
use zeitwork_reconciler::{deployments, domains, pool as vm_pool};

use crate::args::Args;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("bus error: {0}")]
    Bus(#[from] zeitwork_common::events::BusError),
    #[error("reconciler error: {0}")]
    Reconcile(#[from] zeitwork_reconciler::Error),
}

/// Events worth reacting to between reconciler ticks. Everything the manager
/// does here is also reachable by pure reconciliation, so lost or duplicated
/// events cost only latency, never correctness.
const SUBJECTS: &[&str] = &[
    "deployment.created",
    "build.updated",
    "vm.updated",
    "domain.created",
];

const QUEUE_GROUP: &str = "zeitwork-managers";

/// Run the fast-path consumer until shutdown.
///
/// The manager deliberately reuses the reconciler's transition functions
/// (without the advisory lock: every write is preconditioned, so concurrent
/// application is safe) rather than carrying its own versions of the rules.
pub async fn run(args: Args, shutdown: CancellationToken) -> Result<(), ManagerError> {
    let pool = zeitwork_common::db::connect(&args.database_url).await?;
    let region_id = vm_pool::ensure_region(&pool, &args.region_code).await?;
    let bus = Bus::connect(&args.nats_url).await?;

    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(error) => {
            warn!(%error, "no usable system resolver config, using defaults");
            TokioAsyncResolver::tokio(Default::default(), Default::default())
        }
    };

    let mut subscriptions = SelectAll::new();
    for subject in SUBJECTS {
        subscriptions.push(bus.queue_subscribe(subject, QUEUE_GROUP).await?);
    }
    info!(subjects = ?SUBJECTS, "manager subscribed");

    let startup_timeout = Duration::from_secs(args.startup_timeout_secs);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("manager stopping");
                return Ok(());
            }
            message = subscriptions.next() => {
                let Some(message) = message else {
                    warn!("bus subscription ended, exiting for restart");
                    return Ok(());
                };

                let id = serde_json::from_slice::<zeitwork_common::events::ChangePayload>(
                    &message.payload,
                )
                .map(|p| p.id)
                .ok();

                if let Err(error) = handle(
                    &pool,
                    &resolver,
                    region_id,
                    args.workload_port,
                    startup_timeout,
                    message.subject.as_str(),
                    id,
                )
                .await
                {
                    warn!(
                        subject = message.subject.as_str(),
                        error = &error as &dyn std::error::Error,
                        "fast path failed, the next reconciler cycle will catch up"
                    );
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle(
    pool: &PgPool,
    resolver: &TokioAsyncResolver,
    region_id: Uuid,
    workload_port: i32,
    startup_timeout: Duration,
    subject: &str,
    id: Option<Uuid>,
) -> Result<(), ManagerError> {
    debug!(subject, ?id, "fast path event");

    match subject {
        "deployment.created" => {
            deployments::start_pending(pool).await?;
        }
        "build.updated" => {
            deployments::progress_building(pool, region_id, workload_port).await?;
        }
        "vm.updated" => {
            deployments::progress_starting(pool, startup_timeout).await?;
            deployments::release_vms(pool).await?;
        }
        "domain.created" => {
            domains::verify_domains(pool, resolver).await?;
        }
        other => {
            debug!(subject = other, "no fast path for subject");
        }
    }

    Ok(())
}
