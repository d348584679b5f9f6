//! On-demand certificate issuance and background renewal.
//!
//! The TLS resolver reports every SNI it has no certificate for; the issuer
//! authorizes issuance only for domains verified in the database (or the
//! edge's own hostname), takes the cross-replica lock, runs the ACME order
//! and installs + persists the result.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::acme::AcmeClient;
use crate::routes::normalize_host;
use crate::storage::CertStore;
use crate::tls::{ChainAndPrivateKey, EdgeCertResolver, RENEWAL_VALIDITY_THRESHOLD_IN_DAYS};
use crate::{EdgeError, Result};

const LOCK_TTL_SECS: i64 = 120;
const RENEWAL_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60 * 12);

pub struct Issuer {
    pool: PgPool,
    store: CertStore,
    resolver: Arc<EdgeCertResolver>,
    acme: AcmeClient,
    own_hostname: String,
    acme_email: String,
    acme_directory: Option<String>,
}

impl Issuer {
    pub fn new(
        pool: PgPool,
        store: CertStore,
        resolver: Arc<EdgeCertResolver>,
        own_hostname: String,
        acme_email: String,
        acme_directory: Option<String>,
    ) -> Self {
        let acme = AcmeClient::new(Arc::clone(&resolver));
        Self {
            pool,
            store,
            resolver,
            acme,
            own_hostname: normalize_host(&own_hostname),
            acme_email,
            acme_directory,
        }
    }

    /// Load everything already issued into the resolver so restarts do not
    /// re-order certificates.
    pub async fn warm_from_store(&self) -> Result<usize> {
        let hosts = self.store.certificate_hosts().await?;
        let mut loaded = 0;
        for host in hosts {
            match self.store.load_certificate(&host).await? {
                Some(pem) => {
                    if let Err(error) = self.resolver.serve_pem(&host, pem.as_bytes()).await {
                        warn!(
                            host,
                            error = &error as &dyn std::error::Error,
                            "stored certificate could not be loaded"
                        );
                    } else {
                        loaded += 1;
                    }
                }
                None => {}
            }
        }
        Ok(loaded)
    }

    /// The on-demand decision: is this hostname allowed a certificate?
    async fn authorized(&self, host: &str) -> Result<bool> {
        if host == self.own_hostname {
            return Ok(true);
        }

        let row: Option<(uuid::Uuid,)> = sqlx::query_as(
            "SELECT id FROM domains
             WHERE name = $1 AND verified_at IS NOT NULL AND deleted_at IS NULL",
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn account_credentials(&self) -> Result<String> {
        if let Some(stored) = self.store.load_account().await? {
            return Ok(stored);
        }

        let credentials = self
            .acme
            .create_account(&self.acme_email, self.acme_directory.clone())
            .await?;
        let serialized = credentials.to_string();
        self.store.store_account(&serialized).await?;
        info!("acme account created");
        Ok(serialized)
    }

    /// Issue (or re-issue) a certificate for an authorized hostname.
    async fn issue(&self, host: &str) -> Result<()> {
        if !self.store.try_lock(host, chrono::Duration::seconds(LOCK_TTL_SECS)).await? {
            return Ok(());
        }

        let outcome = self.issue_locked(host).await;
        if let Err(error) = self.store.unlock(host).await {
            warn!(
                host,
                error = &error as &dyn std::error::Error,
                "failed to release issuance lock (it will expire)"
            );
        }
        outcome
    }

    async fn issue_locked(&self, host: &str) -> Result<()> {
        let stored = self.account_credentials().await?;
        let credentials = serde_json::from_str(&stored)
            .map_err(|_| EdgeError::Storage("stored acme credentials are malformed".into()))?;

        let (chain_pem, key_pem) = self.acme.create_certificate(host, credentials).await?;
        let bundle = format!("{chain_pem}\n{key_pem}");

        let certs = ChainAndPrivateKey::parse_pem(bundle.as_bytes())?;
        self.store.store_certificate(host, &bundle).await?;
        self.resolver.serve(host, certs).await?;

        info!(host, "certificate issued");
        Ok(())
    }

    /// Consume resolver misses until shutdown.
    pub async fn run(&self, mut misses: mpsc::Receiver<String>, shutdown: CancellationToken) {
        loop {
            let host = tokio::select! {
                _ = shutdown.cancelled() => return,
                host = misses.recv() => match host {
                    Some(host) => normalize_host(&host),
                    None => return,
                },
            };

            if self.resolver.has_certificate(&host).await {
                continue;
            }

            match self.authorized(&host).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(host, "hostname is not authorized for issuance");
                    continue;
                }
                Err(error) => {
                    warn!(
                        host,
                        error = &error as &dyn std::error::Error,
                        "authorization check failed"
                    );
                    continue;
                }
            }

            if let Err(error) = self.issue(&host).await {
                warn!(
                    host,
                    error = &error as &dyn std::error::Error,
                    "certificate issuance failed"
                );
            }
        }
    }

    /// Re-issue certificates approaching expiry. Runs forever; the cadence is
    /// slow because the validity window is wide.
    pub async fn renewal_task(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = zeitwork_common::ticker::sleep_jittered(RENEWAL_SWEEP_INTERVAL) => {}
            }

            let hosts = match self.store.certificate_hosts().await {
                Ok(hosts) => hosts,
                Err(error) => {
                    warn!(
                        error = &error as &dyn std::error::Error,
                        "renewal sweep could not list certificates"
                    );
                    continue;
                }
            };

            for host in hosts {
                match self.needs_renewal(&host).await {
                    Ok(true) => {
                        info!(host, "certificate approaching expiry, renewing");
                        if let Err(error) = self.issue(&host).await {
                            warn!(
                                host,
                                error = &error as &dyn std::error::Error,
                                "renewal failed"
                            );
                        }
                    }
                    Ok(false) => {}
                    Err(error) => warn!(
                        host,
                        error = &error as &dyn std::error::Error,
                        "could not inspect stored certificate"
                    ),
                }
            }
        }
    }

    async fn needs_renewal(&self, host: &str) -> Result<bool> {
        let Some(pem) = self.store.load_certificate(host).await? else {
            return Ok(false);
        };
        let certs = ChainAndPrivateKey::parse_pem(pem.as_bytes())?;
        Ok(expires_within_days(
            certs.leaf_der(),
            RENEWAL_VALIDITY_THRESHOLD_IN_DAYS,
        )?)
    }
}

/// Whether a DER certificate expires within `days` from now.
pub fn expires_within_days(der: &[u8], days: i64) -> Result<bool> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| EdgeError::Tls(format!("stored certificate is not valid der: {e}")))?;

    let not_after = cert.validity().not_after.timestamp();
    let threshold = (Utc::now() + chrono::Duration::days(days)).timestamp();
    Ok(not_after <= threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert_expiring(year: i32) -> Vec<u8> {
        let mut params = rcgen::CertificateParams::new(vec!["app.example.com".to_string()]);
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(year, 1, 1);
        rcgen::Certificate::from_params(params)
            .unwrap()
            .serialize_der()
            .unwrap()
    }

    #[test]
    fn far_future_certificates_do_not_renew() {
        let der = cert_expiring(2200);
        assert!(!expires_within_days(&der, 30).unwrap());
    }

    #[test]
    fn expired_certificates_renew() {
        let der = cert_expiring(2021);
        assert!(expires_within_days(&der, 30).unwrap());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(expires_within_days(b"not der", 30).is_err());
    }
}
