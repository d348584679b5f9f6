use uuid::Uuid;

/// The label prefix a domain owner must publish a TXT record under.
///
/// The full record name is `{base58(domain id)}-zeitwork.{domain name}` and
/// the record value must contain the domain's verification token. Only this
/// naming convention is resolved; older deployments of the platform used
/// `_zeitwork-verify-token.{name}`, which is deliberately not accepted.
pub fn verification_label(domain_id: &Uuid) -> String {
    format!("{}-zeitwork", bs58::encode(domain_id.as_bytes()).into_string())
}

/// The fully-qualified TXT record name to resolve for a domain.
pub fn verification_record_name(domain_id: &Uuid, domain_name: &str) -> String {
    format!("{}.{}", verification_label(domain_id), domain_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_name_is_deterministic() {
        let id = Uuid::from_u128(0x0189_6aa2_aa3c_beef_cafe_0123_4567_89ab);

        let a = verification_record_name(&id, "app.example.com");
        let b = verification_record_name(&id, "app.example.com");
        assert_eq!(a, b);
        assert!(a.ends_with("-zeitwork.app.example.com"));
    }

    #[test]
    fn label_is_base58_of_the_id_bytes() {
        let id = Uuid::from_u128(1);
        let label = verification_label(&id);

        let encoded = label.strip_suffix("-zeitwork").unwrap();
        let decoded = bs58::decode(encoded).into_vec().unwrap();
        assert_eq!(decoded, id.as_bytes());
    }

    #[test]
    fn distinct_domains_get_distinct_labels() {
        let a = verification_label(&Uuid::from_u128(1));
        let b = verification_label(&Uuid::from_u128(2));
        assert_ne!(a, b);
    }
}
