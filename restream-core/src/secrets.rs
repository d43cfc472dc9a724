//! Stream-key encryption at rest.
//!
//! Payloads are `iv_b64:data_b64:tag_b64` (standard base64, 12-byte IV,
//! 16-byte GCM tag) under AES-256-GCM keyed with SHA-256 of the install
//! secret. The empty string encrypts and decrypts to itself.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("invalid secret payload")]
    InvalidPayload,
    #[error("invalid base64 in secret payload: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("secret encryption failed")]
    Encrypt,
    #[error("secret could not be decrypted")]
    Decrypt,
    #[error("decrypted secret is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type SecretResult<T> = std::result::Result<T, SecretError>;

#[derive(Clone)]
pub struct SecretCodec {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCodec").finish_non_exhaustive()
    }
}

impl SecretCodec {
    pub fn from_install_secret(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> SecretResult<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let iv: [u8; IV_LEN] = rand::random();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;
        // aes-gcm appends the tag to the ciphertext.
        let (data, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        Ok(format!(
            "{}:{}:{}",
            STANDARD.encode(iv),
            STANDARD.encode(data),
            STANDARD.encode(tag)
        ))
    }

    pub fn decrypt(&self, payload: &str) -> SecretResult<String> {
        if payload.is_empty() {
            return Ok(String::new());
        }
        let mut parts = payload.split(':');
        let (Some(iv), Some(data), Some(tag), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SecretError::InvalidPayload);
        };
        let iv = STANDARD.decode(iv)?;
        let tag = STANDARD.decode(tag)?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(SecretError::InvalidPayload);
        }
        let mut sealed = STANDARD.decode(data)?;
        sealed.extend_from_slice(&tag);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| SecretError::Decrypt)?;
        Ok(String::from_utf8(plaintext)?)
    }
}
