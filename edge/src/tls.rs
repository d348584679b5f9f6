//! TLS serving: certificates resolved by SNI, TLS-ALPN-01 challenge
//! certificates when the handshake asks for `acme-tls/1`, and a channel that
//! reports unknown hostnames so issuance can be attempted on demand.

use std::collections::HashMap;
use std::io::{BufReader, Read};
use std::sync::Arc;

use axum_server::accept::DefaultAcceptor;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::executor::block_on;
use pem::Pem;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{self, CertifiedKey};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::Item;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use crate::EdgeError;

/// Renew a certificate once it is within 30 days of expiry.
pub const RENEWAL_VALIDITY_THRESHOLD_IN_DAYS: i64 = 30;

/// ALPN protocol name the TLS-ALPN-01 validator negotiates.
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

#[derive(Clone)]
pub struct ChainAndPrivateKey {
    chain: Vec<Certificate>,
    private_key: PrivateKey,
}

impl ChainAndPrivateKey {
    pub fn parse_pem<R: Read>(rd: R) -> Result<Self, EdgeError> {
        let mut private_key = None;
        let mut chain = Vec::new();

        for item in rustls_pemfile::read_all(&mut BufReader::new(rd))
            .map_err(|_| EdgeError::Tls("could not parse pem".into()))?
        {
            match item {
                Item::X509Certificate(cert) => chain.push(Certificate(cert)),
                Item::ECKey(key) | Item::PKCS8Key(key) | Item::RSAKey(key) => {
                    private_key = Some(PrivateKey(key))
                }
                _ => return Err(EdgeError::Tls("unexpected item in pem bundle".into())),
            }
        }

        let private_key =
            private_key.ok_or_else(|| EdgeError::Tls("pem bundle has no private key".into()))?;
        if chain.is_empty() {
            return Err(EdgeError::Tls("pem bundle has no certificates".into()));
        }

        Ok(Self { chain, private_key })
    }

    pub fn from_der(chain: Vec<Vec<u8>>, private_key: Vec<u8>) -> Self {
        Self {
            chain: chain.into_iter().map(Certificate).collect(),
            private_key: PrivateKey(private_key),
        }
    }

    /// The first certificate of the chain, for expiry inspection.
    pub fn leaf_der(&self) -> &[u8] {
        &self.chain[0].0
    }

    pub fn into_pem(self) -> Result<String, EdgeError> {
        let mut pems = Vec::new();
        for cert in self.chain {
            pems.push(Pem {
                tag: "CERTIFICATE".to_string(),
                contents: cert.0,
            });
        }

        pems.push(Pem {
            tag: "PRIVATE KEY".to_string(),
            contents: self.private_key.0,
        });

        Ok(pem::encode_many(&pems))
    }

    pub fn into_certified_key(self) -> Result<CertifiedKey, EdgeError> {
        let signing_key = sign::any_supported_type(&self.private_key)
            .map_err(|_| EdgeError::Tls("unsupported private key type".into()))?;
        Ok(CertifiedKey::new(self.chain, signing_key))
    }
}

/// Resolves the certificate for each incoming handshake.
///
/// Regular handshakes get the issued certificate for their SNI (or the
/// default certificate). Handshakes advertising only `acme-tls/1` are the CA
/// validating a challenge and get the per-host challenge certificate instead.
/// An SNI with no certificate at all is pushed onto the miss channel, where
/// the issuer decides whether it deserves one.
pub struct EdgeCertResolver {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    challenges: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    default: RwLock<Option<Arc<CertifiedKey>>>,
    misses: mpsc::Sender<String>,
}

impl EdgeCertResolver {
    pub fn new(misses: mpsc::Sender<String>) -> Self {
        Self {
            certs: RwLock::new(HashMap::new()),
            challenges: RwLock::new(HashMap::new()),
            default: RwLock::new(None),
            misses,
        }
    }

    pub async fn get(&self, sni: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.read().await.get(sni).map(Arc::clone)
    }

    pub async fn has_certificate(&self, sni: &str) -> bool {
        self.certs.read().await.contains_key(sni)
    }

    pub async fn serve_default(&self, certs: ChainAndPrivateKey) -> Result<(), EdgeError> {
        *self.default.write().await = Some(Arc::new(certs.into_certified_key()?));
        Ok(())
    }

    /// Serve this chain and key for handshakes naming `sni`.
    pub async fn serve(&self, sni: &str, certs: ChainAndPrivateKey) -> Result<(), EdgeError> {
        let certified = certs.into_certified_key()?;
        self.certs
            .write()
            .await
            .insert(sni.to_string(), Arc::new(certified));
        Ok(())
    }

    pub async fn serve_pem<R: Read>(&self, sni: &str, rd: R) -> Result<(), EdgeError> {
        let certs = ChainAndPrivateKey::parse_pem(rd)?;
        self.serve(sni, certs).await
    }

    pub async fn serve_challenge(
        &self,
        sni: &str,
        certs: ChainAndPrivateKey,
    ) -> Result<(), EdgeError> {
        let certified = certs.into_certified_key()?;
        self.challenges
            .write()
            .await
            .insert(sni.to_string(), Arc::new(certified));
        Ok(())
    }

    pub async fn remove_challenge(&self, sni: &str) {
        self.challenges.write().await.remove(sni);
    }
}

impl ResolvesServerCert for EdgeCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?.to_string();

        let is_challenge = client_hello
            .alpn()
            .map(|mut protocols| protocols.any(|proto| proto == ACME_TLS_ALPN_NAME))
            .unwrap_or(false);

        let handle = Handle::current();
        let _ = handle.enter();
        block_on(async move {
            if is_challenge {
                return self.challenges.read().await.get(&sni).map(Arc::clone);
            }

            if let Some(cert) = self.get(&sni).await {
                return Some(cert);
            }

            // Unknown hostname: ask the issuer to consider it. Dropped sends
            // are fine, the next handshake asks again.
            let _ = self.misses.try_send(sni);
            self.default.read().await.clone()
        })
    }
}

pub fn make_tls_acceptor(
    misses: mpsc::Sender<String>,
) -> (Arc<EdgeCertResolver>, RustlsAcceptor<DefaultAcceptor>) {
    let resolver = Arc::new(EdgeCertResolver::new(misses));

    let mut server_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::clone(&resolver) as Arc<dyn ResolvesServerCert>);
    server_config.alpn_protocols = vec![
        b"h2".to_vec(),
        b"http/1.1".to_vec(),
        ACME_TLS_ALPN_NAME.to_vec(),
    ];

    let rustls_config = RustlsConfig::from_config(Arc::new(server_config));

    (resolver, RustlsAcceptor::new(rustls_config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(host: &str) -> ChainAndPrivateKey {
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        ChainAndPrivateKey::from_der(
            vec![cert.serialize_der().unwrap()],
            cert.serialize_private_key_der(),
        )
    }

    #[test]
    fn pem_round_trip() {
        let certs = self_signed("app.example.com");
        let pem = certs.into_pem().unwrap();

        let parsed = ChainAndPrivateKey::parse_pem(pem.as_bytes()).unwrap();
        assert_eq!(parsed.chain.len(), 1);
        parsed.into_certified_key().unwrap();
    }

    #[test]
    fn pem_without_a_key_is_rejected() {
        let certs = self_signed("app.example.com");
        let pem = certs.into_pem().unwrap();
        let only_cert: String = pem
            .split_inclusive('\n')
            .take_while(|line| !line.contains("PRIVATE KEY"))
            .collect();

        assert!(ChainAndPrivateKey::parse_pem(only_cert.as_bytes()).is_err());
    }

    #[tokio::test]
    async fn resolver_serves_and_forgets_challenges() {
        let (tx, _rx) = mpsc::channel(8);
        let resolver = EdgeCertResolver::new(tx);

        resolver
            .serve_challenge("app.example.com", self_signed("app.example.com"))
            .await
            .unwrap();
        assert!(resolver
            .challenges
            .read()
            .await
            .contains_key("app.example.com"));

        resolver.remove_challenge("app.example.com").await;
        assert!(resolver.challenges.read().await.is_empty());
    }

    #[tokio::test]
    async fn resolver_tracks_issued_certificates() {
        let (tx, _rx) = mpsc::channel(8);
        let resolver = EdgeCertResolver::new(tx);

        assert!(!resolver.has_certificate("app.example.com").await);
        resolver
            .serve("app.example.com", self_signed("app.example.com"))
            .await
            .unwrap();
        assert!(resolver.has_certificate("app.example.com").await);
    }
}
