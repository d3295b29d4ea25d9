//! Vault: header-tagged encrypted values.
//!
//! Variable values (or whole vars files) beginning with the recognized
//! header line are treated as opaque ciphertext: base64-wrapped salt,
//! nonce, and AES-256-GCM payload, with the key derived from the vault
//! password via Argon2. The runner only consumes vault values; the
//! encrypt side exists for tooling and round-trip tests.

use aes_gcm::aead::generic_array::{typenum, GenericArray};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit};
use argon2::password_hash::SaltString;
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use thiserror::Error;

/// Header line marking an encrypted payload.
const VAULT_HEADER: &str = "$STAGEHAND_VAULT;1.0;AES256";

/// Errors raised by vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid vault format")]
    InvalidFormat,

    #[error("vault decryption failed (wrong password?)")]
    DecryptionFailed,

    #[error("vault encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("vault key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("no vault password supplied")]
    NoPassword,
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Encrypts and decrypts vault payloads with one password.
pub struct Vault {
    password: String,
}

impl Vault {
    /// Create a vault bound to a password.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }

    /// Whether the content carries the vault header.
    pub fn is_encrypted(content: &str) -> bool {
        content.trim_start().starts_with("$STAGEHAND_VAULT")
    }

    /// Encrypt plaintext into the header-tagged format.
    pub fn encrypt(&self, content: &str) -> VaultResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let key = self.derive_key(&salt)?;

        let cipher = Aes256Gcm::new(&key);
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, content.as_bytes())
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

        let mut payload = Vec::new();
        payload.extend_from_slice(salt.as_str().as_bytes());
        payload.push(b'\n');
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);

        Ok(format!("{}\n{}", VAULT_HEADER, BASE64.encode(&payload)))
    }

    /// Decrypt a header-tagged payload back to the byte stream, returned
    /// as text for the variable layer to parse as a scalar or tree.
    pub fn decrypt(&self, content: &str) -> VaultResult<String> {
        let mut lines = content.trim().lines();
        let header = lines.next().ok_or(VaultError::InvalidFormat)?;
        if !header.starts_with("$STAGEHAND_VAULT") {
            return Err(VaultError::InvalidFormat);
        }

        let body: String = lines.collect::<Vec<_>>().join("");
        let payload = BASE64
            .decode(body.trim())
            .map_err(|_| VaultError::InvalidFormat)?;

        let salt_end = payload
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(VaultError::InvalidFormat)?;
        let salt_str =
            std::str::from_utf8(&payload[..salt_end]).map_err(|_| VaultError::InvalidFormat)?;
        let salt = SaltString::from_b64(salt_str).map_err(|_| VaultError::InvalidFormat)?;

        let nonce_start = salt_end + 1;
        if payload.len() < nonce_start + 12 {
            return Err(VaultError::InvalidFormat);
        }
        let nonce = GenericArray::from_slice(&payload[nonce_start..nonce_start + 12]);
        let ciphertext = &payload[nonce_start + 12..];

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new(&key);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::DecryptionFailed)
    }

    fn derive_key(&self, salt: &SaltString) -> VaultResult<GenericArray<u8, typenum::U32>> {
        let argon2 = Argon2::default();
        let mut key = [0u8; 32];
        argon2
            .hash_password_into(
                self.password.as_bytes(),
                salt.as_str().as_bytes(),
                &mut key,
            )
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;
        Ok(GenericArray::clone_from_slice(&key))
    }
}

/// Decrypt a value if it carries the vault header, passing everything else
/// through untouched. With no password configured, encrypted values are an
/// error.
pub fn maybe_decrypt(content: &str, password: Option<&str>) -> VaultResult<String> {
    if !Vault::is_encrypted(content) {
        return Ok(content.to_string());
    }
    let password = password.ok_or(VaultError::NoPassword)?;
    Vault::new(password).decrypt(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let vault = Vault::new("correct horse");
        let encrypted = vault.encrypt("db_password: sekrit\n").unwrap();
        assert!(Vault::is_encrypted(&encrypted));
        assert_eq!(vault.decrypt(&encrypted).unwrap(), "db_password: sekrit\n");
    }

    #[test]
    fn test_wrong_password_fails() {
        let encrypted = Vault::new("right").encrypt("secret").unwrap();
        let err = Vault::new("wrong").decrypt(&encrypted).unwrap_err();
        assert!(matches!(err, VaultError::DecryptionFailed));
    }

    #[test]
    fn test_plaintext_rejected() {
        let vault = Vault::new("pw");
        assert!(matches!(
            vault.decrypt("just text"),
            Err(VaultError::InvalidFormat)
        ));
    }

    #[test]
    fn test_maybe_decrypt_passthrough() {
        assert_eq!(maybe_decrypt("plain", None).unwrap(), "plain");
    }

    #[test]
    fn test_maybe_decrypt_requires_password() {
        let encrypted = Vault::new("pw").encrypt("x").unwrap();
        assert!(matches!(
            maybe_decrypt(&encrypted, None),
            Err(VaultError::NoPassword)
        ));
        assert_eq!(maybe_decrypt(&encrypted, Some("pw")).unwrap(), "x");
    }
}
