//! Authenticated encryption of certificate blobs at rest (AES-256-GCM).
//!
//! Stored layout: `nonce(12) || tag(16) || ciphertext`.
//!
//! Key material comes from `CERT_ENCRYPTION_KEY`. A value that base64-decodes
//! to exactly 32 bytes is used as-is; anything else is hashed with SHA-256 so
//! blobs written with older passphrase-style keys stay readable.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("certificate encryption key is not configured")]
    MissingKey,
    #[error("input is not valid base64: {0}")]
    InvalidInput(String),
    #[error("ciphertext failed authentication (wrong key or tampered data)")]
    Authentication,
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

/// Symmetric cipher for small secret blobs.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_LEN],
}

impl Drop for SecretCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl core::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Build a cipher from configured key material; `None` or blank is fatal.
    pub fn from_config(material: Option<&str>) -> Result<Self, CipherError> {
        match material {
            Some(m) if !m.trim().is_empty() => Ok(Self::derive(m)),
            _ => Err(CipherError::MissingKey),
        }
    }

    fn derive(material: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        match STANDARD.decode(material.trim()) {
            Ok(mut bytes) if bytes.len() == KEY_LEN => {
                key.copy_from_slice(&bytes);
                bytes.zeroize();
            }
            Ok(mut bytes) => {
                bytes.zeroize();
                key.copy_from_slice(&Sha256::digest(material.as_bytes()));
            }
            Err(_) => key.copy_from_slice(&Sha256::digest(material.as_bytes())),
        }
        Self { key }
    }

    fn aead(&self) -> Result<Aes256Gcm, CipherError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| CipherError::Malformed(e.to_string()))
    }

    /// Encrypt a base64 blob. A fresh random nonce is drawn per call.
    pub fn encrypt(&self, base64_blob: &str) -> Result<Vec<u8>, CipherError> {
        let mut buffer = STANDARD
            .decode(base64_blob.trim())
            .map_err(|e| CipherError::InvalidInput(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let tag = self
            .aead()?
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
            .map_err(|_| CipherError::Malformed("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + buffer.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&buffer);
        buffer.zeroize();
        Ok(out)
    }

    /// Decrypt bytes produced by [`SecretCipher::encrypt`] back to base64.
    pub fn decrypt(&self, data: &[u8]) -> Result<String, CipherError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Malformed(format!(
                "expected at least {} bytes, got {}",
                NONCE_LEN + TAG_LEN,
                data.len()
            )));
        }
        let (nonce, rest) = data.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut buffer = ciphertext.to_vec();
        self.aead()?
            .decrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut buffer, Tag::from_slice(tag))
            .map_err(|_| CipherError::Authentication)?;

        let encoded = STANDARD.encode(&buffer);
        buffer.zeroize();
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cipher() -> SecretCipher {
        SecretCipher::from_config(Some("uma frase secreta qualquer")).unwrap()
    }

    #[test]
    fn missing_key_is_fatal() {
        assert_eq!(
            SecretCipher::from_config(None).unwrap_err(),
            CipherError::MissingKey
        );
        assert_eq!(
            SecretCipher::from_config(Some("  ")).unwrap_err(),
            CipherError::MissingKey
        );
    }

    #[test]
    fn raw_32_byte_keys_are_used_directly() {
        let raw = [7u8; KEY_LEN];
        let encoded = STANDARD.encode(raw);
        let c = SecretCipher::from_config(Some(&encoded)).unwrap();
        assert_eq!(c.key, raw);

        let hashed = SecretCipher::from_config(Some("short")).unwrap();
        assert_eq!(hashed.key.as_slice(), Sha256::digest(b"short").as_slice());
    }

    #[test]
    fn layout_is_nonce_tag_ciphertext() {
        let plaintext = STANDARD.encode(b"certificado-a1");
        let sealed = cipher().encrypt(&plaintext).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + TAG_LEN + b"certificado-a1".len());
    }

    #[test]
    fn nonces_differ_between_calls() {
        let plaintext = STANDARD.encode(b"same input");
        let c = cipher();
        assert_ne!(c.encrypt(&plaintext).unwrap(), c.encrypt(&plaintext).unwrap());
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let c = cipher();
        let mut sealed = c.encrypt(&STANDARD.encode(b"pfx bytes")).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(c.decrypt(&sealed).unwrap_err(), CipherError::Authentication);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = cipher().encrypt(&STANDARD.encode(b"pfx bytes")).unwrap();
        let other = SecretCipher::from_config(Some("outra chave")).unwrap();
        assert_eq!(other.decrypt(&sealed).unwrap_err(), CipherError::Authentication);
    }

    #[test]
    fn rejects_short_and_non_base64_input() {
        let c = cipher();
        assert!(matches!(c.decrypt(&[0u8; 10]), Err(CipherError::Malformed(_))));
        assert!(matches!(c.encrypt("not base64!!"), Err(CipherError::InvalidInput(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        #[test]
        fn decrypt_inverts_encrypt(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
            let c = cipher();
            let input = STANDARD.encode(&bytes);
            let sealed = c.encrypt(&input).unwrap();
            prop_assert_eq!(c.decrypt(&sealed).unwrap(), input);
        }
    }
}
