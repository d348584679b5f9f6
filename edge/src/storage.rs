//! Certificate and ACME-account persistence in the shared database, plus the
//! lock table that keeps replicas from racing each other to issuance.

use chrono::Duration;
use sqlx::PgPool;
use tracing::debug;

use crate::Result;

const ACCOUNT_KEY: &str = "acme/account.json";

fn certificate_key(host: &str) -> String {
    format!("certificates/{host}.pem")
}

#[derive(Clone)]
pub struct CertStore {
    pool: PgPool,
}

impl CertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM edge_certificates WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO edge_certificates (key, value, modified) VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, modified = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The PEM bundle (chain + private key) for a host, if one was issued.
    pub async fn load_certificate(&self, host: &str) -> Result<Option<String>> {
        let Some(raw) = self.get(&certificate_key(host)).await? else {
            return Ok(None);
        };
        String::from_utf8(raw)
            .map(Some)
            .map_err(|_| crate::EdgeError::Storage(format!("certificate for {host} is not utf-8")))
    }

    pub async fn store_certificate(&self, host: &str, pem_bundle: &str) -> Result<()> {
        self.put(&certificate_key(host), pem_bundle.as_bytes()).await
    }

    /// Hosts with a stored certificate; used to warm the resolver on boot and
    /// by the renewal sweep.
    pub async fn certificate_hosts(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM edge_certificates WHERE key LIKE 'certificates/%'",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(key,)| {
                key.strip_prefix("certificates/")?
                    .strip_suffix(".pem")
                    .map(str::to_string)
            })
            .collect())
    }

    pub async fn load_account(&self) -> Result<Option<String>> {
        let Some(raw) = self.get(ACCOUNT_KEY).await? else {
            return Ok(None);
        };
        String::from_utf8(raw)
            .map(Some)
            .map_err(|_| crate::EdgeError::Storage("account credentials are not utf-8".into()))
    }

    pub async fn store_account(&self, credentials: &str) -> Result<()> {
        self.put(ACCOUNT_KEY, credentials.as_bytes()).await
    }

    /// Take the issuance lock for a host. An expired lock row counts as free,
    /// so a replica that died mid-issuance only blocks others until the TTL
    /// runs out.
    pub async fn try_lock(&self, host: &str, ttl: Duration) -> Result<bool> {
        let acquired: Option<(String,)> = sqlx::query_as(
            "INSERT INTO edge_locks (key, expires)
             VALUES ($1, now() + ($2 * interval '1 second'))
             ON CONFLICT (key) DO UPDATE
               SET expires = EXCLUDED.expires
               WHERE edge_locks.expires < now()
             RETURNING key",
        )
        .bind(host)
        .bind(ttl.num_seconds())
        .fetch_optional(&self.pool)
        .await?;

        let acquired = acquired.is_some();
        if !acquired {
            debug!(host, "issuance lock held elsewhere");
        }
        Ok(acquired)
    }

    pub async fn unlock(&self, host: &str) -> Result<()> {
        sqlx::query("DELETE FROM edge_locks WHERE key = $1")
            .bind(host)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
