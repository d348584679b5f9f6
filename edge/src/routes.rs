//! The in-memory `host → backend` table.
//!
//! A single refresh task rewrites the table from the database every few
//! seconds; request handlers only ever take the read side of the lock. A
//! route exists iff the domain is verified, points at a deployment, and that
//! deployment's VM is running with an address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backend {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Backend>>,
}

impl RouteTable {
    pub async fn lookup(&self, host: &str) -> Option<Backend> {
        self.routes.read().await.get(host).copied()
    }

    pub async fn replace(&self, routes: HashMap<String, Backend>) {
        *self.routes.write().await = routes;
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn refresh(&self, pool: &PgPool) -> Result<usize, sqlx::Error> {
        let rows: Vec<(String, IpNetwork, i32)> = sqlx::query_as(
            "SELECT dom.name, v.ip_address, v.port
             FROM domains dom
             JOIN deployments d ON d.id = dom.deployment_id
             JOIN vms v ON v.id = d.vm_id
             WHERE dom.verified_at IS NOT NULL
               AND dom.deleted_at IS NULL
               AND v.status = 'running'
               AND v.ip_address IS NOT NULL
               AND v.port IS NOT NULL",
        )
        .fetch_all(pool)
        .await?;

        let routes: HashMap<String, Backend> = rows
            .into_iter()
            .map(|(name, ip, port)| {
                (
                    normalize_host(&name),
                    Backend {
                        ip: ip.ip(),
                        port: port as u16,
                    },
                )
            })
            .collect();

        let count = routes.len();
        self.replace(routes).await;
        Ok(count)
    }
}

/// Lowercase, strip any `:port` suffix and a trailing dot, so the `Host`
/// header and SNI values compare equal to stored domain names.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    if let Some(rest) = host.strip_prefix('[') {
        // bracketed ipv6 literal, possibly followed by a port
        if let Some((addr, _)) = rest.split_once(']') {
            return format!("[{}]", addr.to_ascii_lowercase());
        }
    }

    let host = match host.split_once(':') {
        // a single colon followed by digits is a port; more colons mean a
        // bare ipv6 literal
        Some((name, port))
            if !port.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Periodically rebuild the table until shutdown.
pub async fn refresh_task(
    table: std::sync::Arc<RouteTable>,
    pool: PgPool,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut known = usize::MAX;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("route refresh stopping");
                return;
            }
            _ = zeitwork_common::ticker::sleep_jittered(interval) => {}
        }

        match table.refresh(&pool).await {
            Ok(count) => {
                if count != known {
                    info!(routes = count, "route table refreshed");
                    known = count;
                } else {
                    debug!(routes = count, "route table refreshed");
                }
            }
            Err(error) => warn!(
                error = &error as &dyn std::error::Error,
                "route refresh failed, serving the previous table"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn hosts_are_normalized() {
        assert_eq!(normalize_host("App.Example.COM"), "app.example.com");
        assert_eq!(normalize_host("app.example.com:8443"), "app.example.com");
        assert_eq!(normalize_host("app.example.com."), "app.example.com");
        assert_eq!(normalize_host(" app.example.com "), "app.example.com");
    }

    #[test]
    fn ipv6_literals_keep_their_colons() {
        assert_eq!(normalize_host("[::1]:443"), "[::1]");
        assert_eq!(normalize_host("::1"), "::1");
    }

    #[tokio::test]
    async fn replace_swaps_the_whole_table() {
        let table = RouteTable::default();
        let backend = Backend {
            ip: "10.1.0.2".parse().unwrap(),
            port: 8080,
        };

        table
            .replace(HashMap::from([("app.example.com".to_string(), backend)]))
            .await;
        assert_eq!(table.lookup("app.example.com").await, Some(backend));

        table.replace(HashMap::new()).await;
        assert_eq!(table.lookup("app.example.com").await, None);
        assert_eq!(table.len().await, 0);
    }
}
