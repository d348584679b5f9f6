//! The per-host reconciliation loop: make the local runtime look like what
//! the database says this node should be running, and report reality back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use sqlx::types::Json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeitwork_common::models::VmStatus;
use zeitwork_common::secrets::SecretCipher;

use crate::args::{Args, RuntimeMode};
use crate::logs::{self, StreamRegistry};
use crate::runtime::{
    docker::DockerRuntime, firecracker::FirecrackerRuntime, InstanceSpec, InstanceState, Runtime,
    RuntimeInstance,
};
use crate::{AgentError, Result};

/// A VM row this node is responsible for, joined with its image.
#[derive(Debug, Clone, sqlx::FromRow)]
struct DesiredInstance {
    id: Uuid,
    status: VmStatus,
    vcpus: i32,
    memory_mb: i32,
    port: Option<i32>,
    ip_address: Option<IpNetwork>,
    env_variables: Json<HashMap<String, String>>,
    registry: Option<String>,
    repository: Option<String>,
    tag: Option<String>,
    disk_image_key: Option<String>,
}

impl DesiredInstance {
    fn image_reference(&self) -> Option<String> {
        Some(format!(
            "{}/{}:{}",
            self.registry.as_deref()?,
            self.repository.as_deref()?,
            self.tag.as_deref()?
        ))
    }
}

/// What one cycle has to do, computed from the desired and actual sets.
#[derive(Debug, Default, PartialEq)]
pub struct Plan {
    pub to_start: Vec<Uuid>,
    pub to_stop: Vec<Uuid>,
    /// Desired `stopping` but nothing left in the runtime: just record it.
    pub to_mark_stopped: Vec<Uuid>,
}

pub fn plan(desired: &[(Uuid, VmStatus)], actual: &[(Uuid, InstanceState)]) -> Plan {
    let desired_ids: HashSet<Uuid> = desired.iter().map(|(id, _)| *id).collect();
    let actual_ids: HashSet<Uuid> = actual.iter().map(|(id, _)| *id).collect();
    let running: HashSet<Uuid> = actual
        .iter()
        .filter(|(_, state)| *state == InstanceState::Running)
        .map(|(id, _)| *id)
        .collect();

    let mut plan = Plan::default();
    for (id, status) in desired {
        match status {
            VmStatus::Pending | VmStatus::Starting | VmStatus::Running => {
                if !running.contains(id) {
                    plan.to_start.push(*id);
                }
            }
            VmStatus::Stopping => {
                if actual_ids.contains(id) {
                    plan.to_stop.push(*id);
                } else {
                    plan.to_mark_stopped.push(*id);
                }
            }
            VmStatus::Pooling | VmStatus::Stopped | VmStatus::Failed => {}
        }
    }

    // Anything of ours the runtime still has that the database no longer
    // wants on this node.
    for id in &actual_ids {
        if !desired_ids.contains(id) {
            plan.to_stop.push(*id);
        }
    }

    plan.to_start.sort();
    plan.to_stop.sort();
    plan.to_mark_stopped.sort();
    plan
}

pub struct NodeAgent {
    pool: PgPool,
    runtime: Arc<dyn Runtime>,
    cipher: SecretCipher,
    streams: StreamRegistry,
    node_id: Uuid,
    interval: Duration,
}

impl NodeAgent {
    pub async fn init(args: &Args) -> Result<Self> {
        let pool = zeitwork_common::db::connect_and_migrate(&args.database_url).await?;
        let cipher = SecretCipher::from_base64_key(&args.secrets_key)?;

        let runtime: Arc<dyn Runtime> = match args.runtime {
            RuntimeMode::Docker => Arc::new(DockerRuntime::new(
                args.docker_network.clone(),
                &args.registry_host,
                &args.registry_username,
                &args.registry_password,
            )?),
            RuntimeMode::Firecracker => Arc::new(FirecrackerRuntime::new(
                args.firecracker_bin.clone(),
                args.jailer_bin.clone(),
                args.kernel_path.clone(),
                args.rootfs_dir.clone(),
                args.data_dir.clone(),
            )),
        };

        let agent = Self {
            pool,
            runtime,
            cipher,
            streams: StreamRegistry::default(),
            node_id: args.node_id,
            interval: Duration::from_secs(args.interval_secs),
        };

        agent.register(args).await?;
        Ok(agent)
    }

    /// Upsert this host's `servers` row with its detected resources.
    async fn register(&self, args: &Args) -> Result<()> {
        let region_id: (Uuid,) = sqlx::query_as(
            "SELECT id FROM regions WHERE code = $1 AND deleted_at IS NULL",
        )
        .bind(&args.region_code)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AgentError::Config(format!(
                "region {:?} does not exist yet; is the reconciler running?",
                args.region_code
            ))
        })?;

        let hostname = detect_hostname().await;
        let vcpus = num_cpus::get() as i32;
        let memory_mb = detect_memory_mb().await.unwrap_or(0);

        sqlx::query(
            "INSERT INTO servers
               (id, region_id, hostname, internal_ip, ip_range, status, vcpus, memory_mb,
                last_heartbeat_at)
             VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, now())
             ON CONFLICT (id) DO UPDATE SET
               hostname = EXCLUDED.hostname,
               internal_ip = EXCLUDED.internal_ip,
               ip_range = EXCLUDED.ip_range,
               status = 'active',
               vcpus = EXCLUDED.vcpus,
               memory_mb = EXCLUDED.memory_mb,
               last_heartbeat_at = now(),
               updated_at = now(),
               deleted_at = NULL",
        )
        .bind(self.node_id)
        .bind(region_id.0)
        .bind(&hostname)
        .bind(IpNetwork::from(args.internal_ip))
        .bind(args.ip_range)
        .bind(vcpus)
        .bind(memory_mb)
        .execute(&self.pool)
        .await?;

        info!(node = %self.node_id, hostname, vcpus, memory_mb, "node registered");
        Ok(())
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(node = %self.node_id, "node agent started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = zeitwork_common::ticker::sleep_jittered(self.interval) => {}
            }

            if let Err(error) = self.cycle().await {
                warn!(
                    error = &error as &dyn std::error::Error,
                    "reconcile cycle failed, retrying next tick"
                );
            }
        }

        info!("node agent draining");
        self.streams.cancel_all().await;
        if let Err(error) = self.runtime.close().await {
            warn!(
                error = &error as &dyn std::error::Error,
                "runtime close failed"
            );
        }
    }

    pub async fn cycle(&self) -> Result<()> {
        sqlx::query(
            "UPDATE servers SET last_heartbeat_at = now(), updated_at = now() WHERE id = $1",
        )
        .bind(self.node_id)
        .execute(&self.pool)
        .await?;

        let desired: Vec<DesiredInstance> = sqlx::query_as(
            "SELECT v.id, v.status, v.vcpus, v.memory_mb, v.port, v.ip_address,
                    v.env_variables,
                    i.registry, i.repository, i.tag, i.disk_image_key
             FROM vms v
             LEFT JOIN images i ON i.id = v.image_id
             WHERE v.server_id = $1 AND v.deleted_at IS NULL
               AND v.status IN ('pending', 'starting', 'running', 'stopping')
             ORDER BY v.id",
        )
        .bind(self.node_id)
        .fetch_all(&self.pool)
        .await?;

        // Runtime unreachable: skip the whole cycle, write nothing.
        let actual = match self.runtime.list().await {
            Ok(actual) => actual,
            Err(error) => {
                warn!(
                    error = &error as &dyn std::error::Error,
                    "runtime unreachable, skipping cycle"
                );
                return Ok(());
            }
        };

        let desired_pairs: Vec<(Uuid, VmStatus)> =
            desired.iter().map(|d| (d.id, d.status)).collect();
        let actual_pairs: Vec<(Uuid, InstanceState)> = actual
            .iter()
            .map(|a| (a.instance_id, a.state))
            .collect();
        let plan = plan(&desired_pairs, &actual_pairs);

        if !plan.to_start.is_empty() || !plan.to_stop.is_empty() || !plan.to_mark_stopped.is_empty()
        {
            debug!(
                start = plan.to_start.len(),
                stop = plan.to_stop.len(),
                mark_stopped = plan.to_mark_stopped.len(),
                "reconciling runtime"
            );
        }

        let by_id: HashMap<Uuid, &DesiredInstance> =
            desired.iter().map(|d| (d.id, d)).collect();

        for id in plan.to_start {
            if let Some(instance) = by_id.get(&id) {
                if let Err(error) = self.start_instance(instance).await {
                    warn!(
                        vm = %id,
                        error = &error as &dyn std::error::Error,
                        "failed to start instance"
                    );
                }
            }
        }

        for id in plan.to_stop {
            self.stop_instance(id, by_id.contains_key(&id)).await;
        }

        for id in plan.to_mark_stopped {
            sqlx::query(
                "UPDATE vms SET status = 'stopped', stopped_at = now(), updated_at = now()
                 WHERE id = $1 AND status = 'stopping'",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
        }

        self.ensure_log_streams(&actual, &by_id).await;

        Ok(())
    }

    async fn start_instance(&self, instance: &DesiredInstance) -> Result<()> {
        let Some(image) = instance.image_reference() else {
            warn!(vm = %instance.id, "desired instance has no image yet, skipping");
            return Ok(());
        };

        sqlx::query(
            "UPDATE vms SET status = 'starting', starting_at = now(), updated_at = now()
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(instance.id)
        .execute(&self.pool)
        .await?;

        let port = instance.port.unwrap_or(8080) as u16;

        // Values are encrypted at rest; they are only in the clear here, on
        // their way into the runtime. A value that does not decrypt was
        // tampered with or written under another key, and an instance must
        // not come up without its configuration.
        let mut env = HashMap::new();
        for (name, value) in instance.env_variables.0.iter() {
            match self.cipher.decrypt(value) {
                Ok(value) => {
                    env.insert(name.clone(), value);
                }
                Err(error) => {
                    warn!(vm = %instance.id, variable = %name, %error, "undecryptable variable");
                    sqlx::query(
                        "UPDATE vms SET status = 'failed', failed_at = now(), updated_at = now()
                         WHERE id = $1 AND status IN ('pending', 'starting')",
                    )
                    .bind(instance.id)
                    .execute(&self.pool)
                    .await?;
                    return Ok(());
                }
            }
        }
        env.insert("PORT".to_string(), port.to_string());

        let spec = InstanceSpec {
            id: instance.id,
            image,
            disk_image_key: instance.disk_image_key.clone(),
            ip: instance.ip_address.map(|network| network.ip()),
            vcpus: instance.vcpus,
            memory_mb: instance.memory_mb,
            port,
            env,
        };

        match self.runtime.start(&spec).await {
            Ok(()) => {
                // Reconcile the runtime-assigned address back into the row.
                if let Ok(Some(running)) = self.runtime.status(instance.id).await {
                    if let Some(actual_ip) = running.ip {
                        let desired_ip = instance.ip_address.map(|network| network.ip());
                        if desired_ip != Some(actual_ip) {
                            info!(vm = %instance.id, %actual_ip, "reconciling instance address");
                            sqlx::query(
                                "UPDATE vms SET ip_address = $1, updated_at = now() WHERE id = $2",
                            )
                            .bind(IpNetwork::from(actual_ip))
                            .bind(instance.id)
                            .execute(&self.pool)
                            .await?;
                        }
                    }
                }

                sqlx::query(
                    "UPDATE vms SET status = 'running', running_at = now(), updated_at = now()
                     WHERE id = $1 AND status IN ('pending', 'starting')",
                )
                .bind(instance.id)
                .execute(&self.pool)
                .await?;

                self.attach_log_stream(instance.id).await;
                info!(vm = %instance.id, "instance running");
                Ok(())
            }
            Err(error) => {
                sqlx::query(
                    "UPDATE vms SET status = 'failed', failed_at = now(), updated_at = now()
                     WHERE id = $1 AND status IN ('pending', 'starting')",
                )
                .bind(instance.id)
                .execute(&self.pool)
                .await?;
                Err(error.into())
            }
        }
    }

    /// Stop streaming first, then the instance; only a successful stop is
    /// recorded, a failed one is retried next cycle.
    async fn stop_instance(&self, id: Uuid, known: bool) {
        self.streams.cancel(id).await;

        if let Err(error) = self.runtime.stop(id).await {
            warn!(
                vm = %id,
                error = &error as &dyn std::error::Error,
                "failed to stop instance, will retry"
            );
            return;
        }

        if known {
            if let Err(error) = sqlx::query(
                "UPDATE vms SET status = 'stopped', stopped_at = now(), updated_at = now()
                 WHERE id = $1 AND status = 'stopping'",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            {
                warn!(
                    vm = %id,
                    error = &error as &dyn std::error::Error,
                    "instance stopped but the row update failed"
                );
            }
        }
    }

    async fn attach_log_stream(&self, vm_id: Uuid) {
        let Some(token) = self.streams.register(vm_id).await else {
            return;
        };

        match self.runtime.logs(vm_id, true).await {
            Ok(lines) => {
                let pool = self.pool.clone();
                let registry = self.streams.clone();
                tokio::spawn(async move {
                    logs::pump(pool, vm_id, lines, token).await;
                    registry.release(vm_id).await;
                });
            }
            Err(error) => {
                self.streams.release(vm_id).await;
                warn!(
                    vm = %vm_id,
                    error = &error as &dyn std::error::Error,
                    "could not open log stream"
                );
            }
        }
    }

    /// Instances already running (for example after an agent restart) get
    /// their log stream re-attached; `register` makes this idempotent.
    async fn ensure_log_streams(
        &self,
        actual: &[RuntimeInstance],
        desired: &HashMap<Uuid, &DesiredInstance>,
    ) {
        for instance in actual {
            if instance.state == InstanceState::Running
                && desired.contains_key(&instance.instance_id)
            {
                self.attach_log_stream(instance.instance_id).await;
            }
        }
    }
}

async fn detect_hostname() -> String {
    if let Ok(hostname) = tokio::fs::read_to_string("/proc/sys/kernel/hostname").await {
        return hostname.trim().to_string();
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

async fn detect_memory_mb() -> Option<i32> {
    let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    let line = meminfo.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kb: i64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some((kb / 1024) as i32)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn desired_but_absent_instances_start() {
        let plan = plan(
            &[(uuid(1), VmStatus::Pending), (uuid(2), VmStatus::Running)],
            &[(uuid(2), InstanceState::Running)],
        );

        assert_eq!(plan.to_start, vec![uuid(1)]);
        assert!(plan.to_stop.is_empty());
    }

    #[test]
    fn agreeing_sets_produce_an_empty_plan() {
        let plan = plan(
            &[(uuid(1), VmStatus::Running)],
            &[(uuid(1), InstanceState::Running)],
        );

        assert_eq!(plan, Plan::default());
    }

    #[test]
    fn crashed_instances_are_restarted() {
        let plan = plan(
            &[(uuid(1), VmStatus::Running)],
            &[(uuid(1), InstanceState::Exited)],
        );

        assert_eq!(plan.to_start, vec![uuid(1)]);
    }

    #[test]
    fn orphans_are_stopped() {
        let plan = plan(&[], &[(uuid(9), InstanceState::Running)]);

        assert_eq!(plan.to_stop, vec![uuid(9)]);
    }

    #[test]
    fn stopping_instances_stop_or_get_recorded() {
        let plan = plan(
            &[
                (uuid(1), VmStatus::Stopping),
                (uuid(2), VmStatus::Stopping),
            ],
            &[(uuid(1), InstanceState::Running)],
        );

        assert_eq!(plan.to_stop, vec![uuid(1)]);
        assert_eq!(plan.to_mark_stopped, vec![uuid(2)]);
    }

    #[test]
    fn pooling_rows_are_left_alone() {
        let plan = plan(&[(uuid(1), VmStatus::Pooling)], &[]);

        assert_eq!(plan, Plan::default());
    }
}
