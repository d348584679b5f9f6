use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("encryption key must be 32 bytes, base64 encoded")]
    InvalidKey,
    #[error("ciphertext is not valid base64")]
    InvalidEncoding,
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("decryption failed")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("decrypted value is not valid utf-8")]
    NotUtf8,
}

/// Encrypts and decrypts environment-variable values with AES-256-GCM.
///
/// The wire form is `base64(nonce || ciphertext)` with a random 96-bit nonce
/// per value. The same key is shared by every component that has to read
/// secrets (reconciler when staging a VM, node agent when starting one).
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn from_base64_key(key: &str) -> Result<Self, SecretsError> {
        let key = BASE64.decode(key).map_err(|_| SecretsError::InvalidKey)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SecretsError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretsError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SecretsError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, SecretsError> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|_| SecretsError::InvalidEncoding)?;
        if raw.len() <= NONCE_LEN {
            return Err(SecretsError::Truncated);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretsError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| SecretsError::NotUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        BASE64.encode([7u8; 32])
    }

    #[test]
    fn round_trip() {
        let cipher = SecretCipher::from_base64_key(&test_key()).unwrap();

        let encrypted = cipher.encrypt("DATABASE_URL=postgres://localhost").unwrap();
        assert_ne!(encrypted, "DATABASE_URL=postgres://localhost");

        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, "DATABASE_URL=postgres://localhost");
    }

    #[test]
    fn nonces_are_unique_per_value() {
        let cipher = SecretCipher::from_base64_key(&test_key()).unwrap();

        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_is_detected() {
        let cipher = SecretCipher::from_base64_key(&test_key()).unwrap();

        let encrypted = cipher.encrypt("secret").unwrap();
        let mut raw = BASE64.decode(&encrypted).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;

        assert!(matches!(
            cipher.decrypt(&BASE64.encode(raw)),
            Err(SecretsError::Decrypt)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let cipher = SecretCipher::from_base64_key(&test_key()).unwrap();
        let other = SecretCipher::from_base64_key(&BASE64.encode([9u8; 32])).unwrap();

        let encrypted = cipher.encrypt("secret").unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            SecretCipher::from_base64_key(&BASE64.encode([1u8; 16])),
            Err(SecretsError::InvalidKey)
        ));
    }
}
