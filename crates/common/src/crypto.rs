//! Stored-secret masking for vmrelay
//!
//! Hypervisor API secrets are kept in the server registry in a reversible,
//! byte-wise masked form keyed by a shared secret. This is the storage format
//! the registry agrees on (`unmask(mask(x)) == x` under the same key); it is
//! not a cipher and gives no confidentiality against anyone holding the key.

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Masks and unmasks registry secrets with a key derived from the shared secret.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    /// Build a cipher from the shared secret. An empty secret is a missing key.
    pub fn new(shared_secret: &str) -> Result<Self> {
        if shared_secret.is_empty() {
            return Err(Error::Configuration("secret key is not configured".to_string()));
        }
        let key: [u8; 32] = Sha256::digest(shared_secret.as_bytes()).into();
        Ok(Self { key })
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ self.key[i % self.key.len()])
            .collect()
    }

    /// Mask a plaintext secret into its stored form
    pub fn encrypt(&self, plaintext: &str) -> String {
        STANDARD.encode(self.apply(plaintext.as_bytes()))
    }

    /// Recover the plaintext from its stored form
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let masked = STANDARD
            .decode(stored.trim())
            .map_err(|e| Error::Configuration(format!("stored secret is not valid base64: {e}")))?;
        String::from_utf8(self.apply(&masked))
            .map_err(|_| Error::Configuration("stored secret does not match the secret key".to_string()))
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_roundtrip() {
        let cipher = SecretCipher::new("shared").unwrap();
        let stored = cipher.encrypt("3f1c2a9e-7b44-4d2e-9c1f-0a5b6c7d8e9f");
        assert_ne!(stored, "3f1c2a9e-7b44-4d2e-9c1f-0a5b6c7d8e9f");
        assert_eq!(cipher.decrypt(&stored).unwrap(), "3f1c2a9e-7b44-4d2e-9c1f-0a5b6c7d8e9f");
    }

    #[test]
    fn test_empty_key_is_config_error() {
        assert!(matches!(SecretCipher::new(""), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_garbage_is_config_error() {
        let cipher = SecretCipher::new("shared").unwrap();
        assert!(matches!(cipher.decrypt("%%%"), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_debug_hides_key() {
        let cipher = SecretCipher::new("shared").unwrap();
        assert_eq!(format!("{cipher:?}"), "SecretCipher { .. }");
    }
}
