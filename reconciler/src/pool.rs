//! Warm-VM pool maintenance and address allocation.
//!
//! The pool keeps `pool_size` imageless VMs per region so that a deployment
//! whose build just finished can start without waiting for provisioning.
//! Placement is spread across active servers by current pool count; addresses
//! come out of each server's `ip_range`, with the database exclusion
//! constraint as the final arbiter against concurrent allocators.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use ipnetwork::IpNetwork;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeitwork_common::ids::new_id;

use crate::service::ReconcileConfig;
use crate::Result;

/// Recycled pool VMs older than this are deleted instead, bounding config
/// drift in long-lived warm pools.
const RECYCLE_MAX_AGE_HOURS: i64 = 24;

/// Pick servers for `deficit` new pool VMs, always choosing the server with
/// the fewest pool VMs (ties by id order). With equal counts this degrades to
/// round-robin.
pub fn plan_placements(deficit: usize, servers: &[(Uuid, usize)]) -> Vec<Uuid> {
    if servers.is_empty() {
        return Vec::new();
    }

    let mut counts: Vec<(Uuid, usize)> = servers.to_vec();
    let mut placements = Vec::with_capacity(deficit);
    for _ in 0..deficit {
        let (server, count) = counts
            .iter_mut()
            .min_by_key(|(id, count)| (*count, *id))
            .expect("servers is non-empty");
        placements.push(*server);
        *count += 1;
    }
    placements
}

/// First free address in the range. The network address, the broadcast
/// address and the first host (the server's own side of the bridge) are never
/// handed out. IPv6 ranges are not supported.
pub fn next_free_ip(range: &IpNetwork, used: &HashSet<IpAddr>) -> Option<IpAddr> {
    let IpNetwork::V4(range) = range else {
        return None;
    };

    let network = range.network();
    let broadcast = range.broadcast();
    range
        .iter()
        .filter(|ip| *ip != network && *ip != broadcast)
        .skip(1)
        .map(IpAddr::V4)
        .find(|ip| !used.contains(ip))
}

/// Whether a stopped VM goes back into the pool or away.
pub fn should_recycle(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    pool_deficit: usize,
) -> bool {
    pool_deficit > 0 && now - created_at < Duration::hours(RECYCLE_MAX_AGE_HOURS)
}

/// Look up the region for this reconciler, creating it on first boot.
pub async fn ensure_region(pool: &PgPool, code: &str) -> Result<Uuid> {
    if let Some((id,)) = sqlx::query_as::<_, (Uuid,)>(
        "SELECT id FROM regions WHERE code = $1 AND deleted_at IS NULL",
    )
    .bind(code)
    .fetch_optional(pool)
    .await?
    {
        return Ok(id);
    }

    sqlx::query("INSERT INTO regions (id, code) VALUES ($1, $2) ON CONFLICT (code) DO NOTHING")
        .bind(new_id())
        .bind(code)
        .execute(pool)
        .await?;

    let (id,): (Uuid,) =
        sqlx::query_as("SELECT id FROM regions WHERE code = $1 AND deleted_at IS NULL")
            .bind(code)
            .fetch_one(pool)
            .await?;
    info!(region = code, "region bootstrapped");
    Ok(id)
}

/// Recycle or delete released VMs, then top the pool back up to its target.
pub async fn maintain_pool(pool: &PgPool, region_id: Uuid, config: &ReconcileConfig) -> Result<usize> {
    let mut changed = 0;

    let (pooling,): (i64,) = sqlx::query_as(
        "SELECT count(*) FROM vms
         WHERE region_id = $1 AND status = 'pooling' AND deleted_at IS NULL",
    )
    .bind(region_id)
    .fetch_one(pool)
    .await?;
    let mut deficit = (config.pool_size as i64 - pooling).max(0) as usize;

    // Released VMs: nothing references them any more, decide their fate.
    let released: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
        "SELECT v.id, v.created_at FROM vms v
         WHERE v.region_id = $1 AND v.status = 'stopped' AND v.deleted_at IS NULL
           AND NOT EXISTS (SELECT 1 FROM deployments d WHERE d.vm_id = v.id)
         ORDER BY v.id",
    )
    .bind(region_id)
    .fetch_all(pool)
    .await?;

    let now = Utc::now();
    for (vm_id, created_at) in released {
        if should_recycle(created_at, now, deficit) {
            let result = sqlx::query(
                "UPDATE vms
                 SET status = 'pooling', image_id = NULL, env_variables = '{}'::jsonb,
                     port = NULL, updated_at = now()
                 WHERE id = $1 AND status = 'stopped'",
            )
            .bind(vm_id)
            .execute(pool)
            .await?;
            if result.rows_affected() == 1 {
                debug!(vm = %vm_id, "vm recycled into the pool");
                deficit -= 1;
                changed += 1;
            }
        } else {
            let result = sqlx::query(
                "UPDATE vms SET deleted_at = now(), updated_at = now()
                 WHERE id = $1 AND status = 'stopped'",
            )
            .bind(vm_id)
            .execute(pool)
            .await?;
            if result.rows_affected() == 1 {
                debug!(vm = %vm_id, "vm deleted");
                changed += 1;
            }
        }
    }

    // Failed VMs are never recycled.
    let result = sqlx::query(
        "UPDATE vms SET deleted_at = now(), updated_at = now()
         WHERE region_id = $1 AND status = 'failed' AND deleted_at IS NULL
           AND NOT EXISTS (SELECT 1 FROM deployments d WHERE d.vm_id = vms.id)",
    )
    .bind(region_id)
    .execute(pool)
    .await?;
    changed += result.rows_affected() as usize;

    if deficit == 0 {
        return Ok(changed);
    }

    let servers: Vec<(Uuid, IpNetwork)> = sqlx::query_as(
        "SELECT id, ip_range FROM servers
         WHERE region_id = $1 AND status = 'active' AND deleted_at IS NULL
         ORDER BY id",
    )
    .bind(region_id)
    .fetch_all(pool)
    .await?;
    if servers.is_empty() {
        debug!("no active servers to place pool vms on");
        return Ok(changed);
    }

    let counts: Vec<(Uuid, i64)> = sqlx::query_as(
        "SELECT server_id, count(*) FROM vms
         WHERE server_id IS NOT NULL AND status = 'pooling' AND deleted_at IS NULL
         GROUP BY server_id",
    )
    .fetch_all(pool)
    .await?;

    let load: Vec<(Uuid, usize)> = servers
        .iter()
        .map(|(id, _)| {
            let count = counts
                .iter()
                .find(|(server, _)| server == id)
                .map(|(_, n)| *n as usize)
                .unwrap_or(0);
            (*id, count)
        })
        .collect();

    for server_id in plan_placements(deficit, &load) {
        let range = servers
            .iter()
            .find(|(id, _)| *id == server_id)
            .map(|(_, range)| *range)
            .expect("placement refers to a known server");

        if allocate_pool_vm(pool, region_id, server_id, &range, config).await? {
            changed += 1;
        }
    }

    Ok(changed)
}

async fn allocate_pool_vm(
    pool: &PgPool,
    region_id: Uuid,
    server_id: Uuid,
    range: &IpNetwork,
    config: &ReconcileConfig,
) -> Result<bool> {
    let used: Vec<(IpNetwork,)> = sqlx::query_as(
        "SELECT ip_address FROM vms
         WHERE server_id = $1 AND ip_address IS NOT NULL AND deleted_at IS NULL",
    )
    .bind(server_id)
    .fetch_all(pool)
    .await?;
    let used: HashSet<IpAddr> = used.into_iter().map(|(ip,)| ip.ip()).collect();

    let Some(ip) = next_free_ip(range, &used) else {
        warn!(server = %server_id, "server ip range is exhausted");
        return Ok(false);
    };

    let insert = sqlx::query(
        "INSERT INTO vms (id, region_id, server_id, status, vcpus, memory_mb, ip_address)
         VALUES ($1, $2, $3, 'pooling', $4, $5, $6)",
    )
    .bind(new_id())
    .bind(region_id)
    .bind(server_id)
    .bind(config.pool_vm_vcpus)
    .bind(config.pool_vm_memory_mb)
    .bind(IpNetwork::from(ip))
    .execute(pool)
    .await;

    match insert {
        Ok(_) => {
            info!(server = %server_id, %ip, "pool vm allocated");
            Ok(true)
        }
        // Exclusion-constraint collision: another allocator took the address
        // between our read and write. The next cycle picks the next one.
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23P01") => {
            debug!(server = %server_id, %ip, "address collision, retrying next cycle");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn placements_fill_the_least_loaded_server_first() {
        let servers = vec![(uuid(1), 2), (uuid(2), 0)];

        assert_eq!(
            plan_placements(3, &servers),
            vec![uuid(2), uuid(2), uuid(1)]
        );
    }

    #[test]
    fn equal_load_round_robins() {
        let servers = vec![(uuid(1), 0), (uuid(2), 0)];

        assert_eq!(
            plan_placements(4, &servers),
            vec![uuid(1), uuid(2), uuid(1), uuid(2)]
        );
    }

    #[test]
    fn no_servers_means_no_placements() {
        assert!(plan_placements(3, &[]).is_empty());
    }

    fn range(cidr: &str) -> IpNetwork {
        cidr.parse().unwrap()
    }

    fn ip(addr: &str) -> IpAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn first_usable_address_skips_network_gateway_and_broadcast() {
        let free = next_free_ip(&range("10.1.0.0/29"), &HashSet::new());
        // .0 network, .1 host side, .7 broadcast
        assert_eq!(free, Some(ip("10.1.0.2")));
    }

    #[test]
    fn taken_addresses_are_skipped() {
        let used: HashSet<IpAddr> = [ip("10.1.0.2"), ip("10.1.0.3")].into();

        assert_eq!(next_free_ip(&range("10.1.0.0/29"), &used), Some(ip("10.1.0.4")));
    }

    #[test]
    fn exhausted_range_yields_none() {
        let used: HashSet<IpAddr> = [
            ip("10.1.0.2"),
            ip("10.1.0.3"),
            ip("10.1.0.4"),
            ip("10.1.0.5"),
            ip("10.1.0.6"),
        ]
        .into();

        assert_eq!(next_free_ip(&range("10.1.0.0/29"), &used), None);
    }

    #[test]
    fn ipv6_ranges_are_rejected() {
        assert_eq!(next_free_ip(&range("fd00::/64"), &HashSet::new()), None);
    }

    #[test]
    fn recycling_requires_deficit_and_youth() {
        let now = Utc::now();
        let fresh = now - Duration::hours(1);
        let old = now - Duration::hours(25);

        assert!(should_recycle(fresh, now, 1));
        assert!(!should_recycle(fresh, now, 0));
        assert!(!should_recycle(old, now, 1));
    }
}
