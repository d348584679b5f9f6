//! DNS-based custom-domain verification.

use hickory_resolver::TokioAsyncResolver;
use sqlx::PgPool;
use tracing::{debug, info};
use zeitwork_common::models::Domain;
use zeitwork_common::verification::verification_record_name;

use crate::Result;

/// Verify ownership of recently-touched unverified domains.
///
/// A domain is verified when the TXT record at
/// `{base58(id)}-zeitwork.{name}` contains its verification token. Domains
/// untouched for 48 hours stop being polled; re-saving the domain in the API
/// restarts the clock. Lookup failures are expected while the owner is still
/// configuring DNS and are only logged at debug.
pub async fn verify_domains(pool: &PgPool, resolver: &TokioAsyncResolver) -> Result<usize> {
    // Platform-managed names skip the TXT challenge entirely.
    let auto = sqlx::query(
        "UPDATE domains SET verified_at = now(), updated_at = now()
         WHERE verified_at IS NULL AND NOT txt_verification_required AND deleted_at IS NULL",
    )
    .execute(pool)
    .await?;
    let mut verified = auto.rows_affected() as usize;

    let candidates: Vec<Domain> = sqlx::query_as(
        "SELECT * FROM domains
         WHERE verified_at IS NULL
           AND txt_verification_required
           AND deleted_at IS NULL
           AND updated_at > now() - interval '48 hours'",
    )
    .fetch_all(pool)
    .await?;

    for domain in candidates {
        let record_name = verification_record_name(&domain.id, &domain.name);

        let records = match resolver.txt_lookup(record_name.clone()).await {
            Ok(lookup) => lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<String>()
                })
                .collect::<Vec<_>>(),
            Err(error) => {
                debug!(
                    domain = %domain.name,
                    record = %record_name,
                    %error,
                    "txt lookup failed, will retry next cycle"
                );
                continue;
            }
        };

        if !token_present(&records, &domain.verification_token) {
            debug!(domain = %domain.name, "txt record found but token not present yet");
            continue;
        }

        let result = sqlx::query(
            "UPDATE domains SET verified_at = now(), updated_at = now()
             WHERE id = $1 AND verified_at IS NULL",
        )
        .bind(domain.id)
        .execute(pool)
        .await?;

        if result.rows_affected() == 1 {
            info!(domain = %domain.name, "domain verified");
            verified += 1;
        }
    }

    Ok(verified)
}

/// Any record value *containing* the token counts; owners occasionally paste
/// the token with extra text around it.
fn token_present(records: &[String], token: &str) -> bool {
    records.iter().any(|record| record.contains(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_token_matches() {
        assert!(token_present(&["abc123".into()], "abc123"));
    }

    #[test]
    fn token_embedded_in_a_longer_record_matches() {
        assert!(token_present(
            &["zeitwork-verification=abc123".into()],
            "abc123"
        ));
    }

    #[test]
    fn other_records_do_not_match() {
        assert!(!token_present(
            &["v=spf1 -all".into(), "abc12".into()],
            "abc123"
        ));
        assert!(!token_present(&[], "abc123"));
    }
}
