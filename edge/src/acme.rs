//! ACME client completing TLS-ALPN-01 challenges through the edge's own TLS
//! stack. HTTP-01 is not supported; port 80 never serves challenges.

use std::sync::Arc;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, Authorization, AuthorizationStatus, Challenge, ChallengeType,
    Identifier, LetsEncrypt, NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{Certificate, CertificateParams, CustomExtension, DistinguishedName};
use tokio::time::sleep;
use tracing::{error, trace};

use crate::tls::{ChainAndPrivateKey, EdgeCertResolver};

const MAX_RETRIES: usize = 15;
const MAX_RETRIES_CERTIFICATE_FETCHING: usize = 5;

/// An ACME client implementation that completes TlsAlpn01 challenges.
/// It is safe to clone this type as it functions as a singleton.
#[derive(Clone)]
pub struct AcmeClient {
    resolver: Arc<EdgeCertResolver>,
}

impl AcmeClient {
    pub fn new(resolver: Arc<EdgeCertResolver>) -> Self {
        Self { resolver }
    }

    /// Create a new ACME account that can be restored by deserializing the
    /// returned JSON into [instant_acme::AccountCredentials].
    pub async fn create_account(
        &self,
        email: &str,
        acme_server: Option<String>,
    ) -> Result<serde_json::Value, AcmeClientError> {
        let acme_server = acme_server.unwrap_or_else(|| LetsEncrypt::Production.url().to_string());

        trace!(email, acme_server, "creating acme account");

        let account: NewAccount = NewAccount {
            contact: &[&format!("mailto:{email}")],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let account = Account::create(&account, &acme_server)
            .await
            .map_err(|error| {
                error!(
                    error = &error as &dyn std::error::Error,
                    "got error while creating acme account"
                );
                AcmeClientError::AccountCreation
            })?;

        let credentials = serde_json::to_value(account.credentials()).map_err(|error| {
            error!(
                error = &error as &dyn std::error::Error,
                "got error while extracting credentials from acme account"
            );
            AcmeClientError::Serializing
        })?;

        Ok(credentials)
    }

    /// Create an ACME-signed certificate and return it and its associated
    /// PEM-encoded private key.
    pub async fn create_certificate(
        &self,
        identifier: &str,
        credentials: AccountCredentials<'_>,
    ) -> Result<(String, String), AcmeClientError> {
        trace!(identifier, "requesting acme certificate");

        let account = Account::from_credentials(credentials).map_err(|error| {
            error!(
                error = &error as &dyn std::error::Error,
                "failed to convert acme credentials into account"
            );
            AcmeClientError::AccountCreation
        })?;

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(identifier.to_string())],
            })
            .await
            .map_err(|error| {
                error!(
                    error = &error as &dyn std::error::Error,
                    "failed to order certificate"
                );
                AcmeClientError::OrderCreation
            })?;

        let authorizations = order.authorizations().await.map_err(|error| {
            error!(
                error = &error as &dyn std::error::Error,
                "failed to get authorizations information"
            );
            AcmeClientError::AuthorizationCreation
        })?;

        // There should only ever be 1 authorization as we only provide 1 domain at a time
        debug_assert!(authorizations.len() == 1);
        let authorization = &authorizations[0];

        trace!(?authorization, "got authorization");

        self.complete_challenge(authorization, &mut order).await?;

        let certificate = {
            let mut params = CertificateParams::new(vec![identifier.to_owned()]);
            params.distinguished_name = DistinguishedName::new();
            Certificate::from_params(params).map_err(|error| {
                error!(
                    error = &error as &dyn std::error::Error,
                    "failed to create certificate"
                );
                AcmeClientError::CertificateCreation
            })?
        };
        let signing_request = certificate.serialize_request_der().map_err(|error| {
            error!(
                error = &error as &dyn std::error::Error,
                "failed to create certificate signing request"
            );
            AcmeClientError::CertificateSigning
        })?;

        order.finalize(&signing_request).await.map_err(|error| {
            error!(
                error = &error as &dyn std::error::Error,
                "failed to finalize certificate request"
            );
            AcmeClientError::OrderFinalizing
        })?;

        // Poll for the certificate chain for a few rounds.
        let mut chain: Option<String> = None;
        let mut retries = MAX_RETRIES_CERTIFICATE_FETCHING;
        while chain.is_none() && retries > 0 {
            chain = order.certificate().await.map_err(|error| {
                error!(
                    error = &error as &dyn std::error::Error,
                    "failed to fetch the certificate chain"
                );
                AcmeClientError::CertificateCreation
            })?;
            retries -= 1;
            sleep(Duration::from_secs(1)).await;
        }

        let chain = chain.ok_or(AcmeClientError::CertificateCreation)?;
        Ok((chain, certificate.serialize_private_key_pem()))
    }

    fn find_challenge(authorization: &Authorization) -> Result<&Challenge, AcmeClientError> {
        authorization
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::TlsAlpn01)
            .ok_or_else(|| {
                let error = AcmeClientError::MissingChallenge;
                error!(
                    error = &error as &dyn std::error::Error,
                    "tls-alpn-01 challenge not found"
                );
                error
            })
    }

    async fn wait_for_termination(&self, order: &mut Order) -> Result<(), AcmeClientError> {
        // Exponential backoff until the order changes status
        let mut tries = 1;
        let mut delay = Duration::from_millis(250);
        let state = loop {
            sleep(delay).await;
            let state = order.refresh().await.map_err(|error| {
                error!(
                    error = &error as &dyn std::error::Error,
                    "got error while fetching state"
                );
                AcmeClientError::FetchingState
            })?;

            trace!(?state, "order state refreshed");
            match state.status {
                OrderStatus::Ready => break state,
                OrderStatus::Invalid => {
                    return Err(AcmeClientError::ChallengeInvalid);
                }
                OrderStatus::Pending => {
                    delay *= 2;
                    tries += 1;
                    if tries < MAX_RETRIES {
                        trace!(?state, tries, attempt_in=?delay, "order not yet ready");
                    } else {
                        let error = AcmeClientError::ChallengeTimeout;
                        error!(
                            error = &error as &dyn std::error::Error,
                            ?state,
                            tries,
                            "order not ready in {MAX_RETRIES} tries"
                        );
                        return Err(error);
                    }
                }
                _ => unreachable!(),
            }
        };

        trace!(?state, "challenge completed");

        Ok(())
    }

    /// Serve the challenge certificate, tell the CA to validate, and clean
    /// the challenge up again whatever the outcome.
    async fn complete_challenge(
        &self,
        authorization: &Authorization,
        order: &mut Order,
    ) -> Result<(), AcmeClientError> {
        // Don't complete challenges for an authorization that is already valid
        if let AuthorizationStatus::Valid = authorization.status {
            return Ok(());
        }

        let challenge = Self::find_challenge(authorization)?;
        let Identifier::Dns(identifier) = &authorization.identifier;

        let key_authorization = order.key_authorization(challenge);
        let challenge_cert = challenge_certificate(identifier, key_authorization.digest().as_ref())?;
        self.resolver
            .serve_challenge(identifier, challenge_cert)
            .await
            .map_err(|error| {
                error!(
                    error = &error as &dyn std::error::Error,
                    "failed to install challenge certificate"
                );
                AcmeClientError::ChallengeServing
            })?;

        let result = async {
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|error| {
                    error!(
                        error = &error as &dyn std::error::Error,
                        "failed to mark challenge as ready"
                    );
                    AcmeClientError::SetReadyFailed
                })?;

            self.wait_for_termination(order).await
        }
        .await;

        self.resolver.remove_challenge(identifier).await;

        result
    }
}

/// The self-signed certificate a TLS-ALPN-01 validator expects: the single
/// SAN being validated plus the acmeIdentifier extension carrying the
/// SHA-256 digest of the key authorization.
fn challenge_certificate(
    identifier: &str,
    key_authorization_digest: &[u8],
) -> Result<ChainAndPrivateKey, AcmeClientError> {
    let mut params = CertificateParams::new(vec![identifier.to_owned()]);
    params.distinguished_name = DistinguishedName::new();
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(
        key_authorization_digest,
    )];

    let cert = Certificate::from_params(params).map_err(|error| {
        error!(
            error = &error as &dyn std::error::Error,
            "failed to create challenge certificate"
        );
        AcmeClientError::CertificateCreation
    })?;

    let der = cert
        .serialize_der()
        .map_err(|_| AcmeClientError::CertificateCreation)?;
    let key = cert.serialize_private_key_der();

    Ok(ChainAndPrivateKey::from_der(vec![der], key))
}

#[derive(Debug, strum::Display)]
pub enum AcmeClientError {
    AccountCreation,
    AuthorizationCreation,
    CertificateCreation,
    CertificateSigning,
    ChallengeInvalid,
    ChallengeServing,
    ChallengeTimeout,
    FetchingState,
    OrderCreation,
    OrderFinalizing,
    MissingChallenge,
    Serializing,
    SetReadyFailed,
}

impl std::error::Error for AcmeClientError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_certificates_carry_the_identifier() {
        let digest = [7u8; 32];
        let certs = challenge_certificate("app.example.com", &digest).unwrap();

        // must parse back into something rustls can serve
        certs.into_certified_key().unwrap();
    }
}
