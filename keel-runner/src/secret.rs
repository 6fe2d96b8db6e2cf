//! At-rest secret codec
//!
//! Credential fields are stored as `base64url(iv || AES-CFB(plaintext))` with a
//! random 16 byte IV. The AES variant follows the key length.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use openssl::symm::{Cipher, decrypt, encrypt};
use thiserror::Error;

const BLOCK_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("encrypted value is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("encrypted value is shorter than one cipher block")]
    TooShort,

    #[error("cipher failure: {0}")]
    Cipher(#[from] openssl::error::ErrorStack),

    #[error("decrypted value is not valid UTF-8")]
    NotUtf8,
}

/// Decrypted secret value
///
/// `Debug` never prints the value, so secrets can sit inside structs that get
/// logged.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Encrypts and decrypts credential fields
#[derive(Clone)]
pub struct SecretCodec {
    key: Vec<u8>,
    cipher: Cipher,
}

impl SecretCodec {
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, SecretError> {
        let key = key.as_ref().to_vec();
        let cipher = match key.len() {
            16 => Cipher::aes_128_cfb128(),
            24 => Cipher::aes_192_cfb128(),
            32 => Cipher::aes_256_cfb128(),
            n => return Err(SecretError::InvalidKeyLength(n)),
        };

        Ok(Self { key, cipher })
    }

    /// Encrypts `plain`; empty input stays empty
    pub fn encrypt(&self, plain: &str) -> Result<String, SecretError> {
        if plain.is_empty() {
            return Ok(String::new());
        }

        let mut iv = [0u8; BLOCK_SIZE];
        openssl::rand::rand_bytes(&mut iv)?;

        let ciphertext = encrypt(self.cipher, &self.key, Some(&iv), plain.as_bytes())?;

        let mut out = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);

        Ok(URL_SAFE.encode(out))
    }

    /// Decrypts a stored value; empty input stays empty
    pub fn decrypt(&self, text: &str) -> Result<Secret, SecretError> {
        if text.is_empty() {
            return Ok(Secret::default());
        }

        let raw = URL_SAFE.decode(text.trim())?;
        if raw.len() < BLOCK_SIZE {
            return Err(SecretError::TooShort);
        }

        let (iv, ciphertext) = raw.split_at(BLOCK_SIZE);
        let plain = decrypt(self.cipher, &self.key, Some(iv), ciphertext)?;

        String::from_utf8(plain)
            .map(Secret)
            .map_err(|_| SecretError::NotUtf8)
    }
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCodec")
            .field("key_len", &self.key.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef";

    #[test]
    fn test_rejects_bad_key_length() {
        assert!(matches!(
            SecretCodec::new("short"),
            Err(SecretError::InvalidKeyLength(5))
        ));
        assert!(SecretCodec::new([7u8; 24]).is_ok());
        assert!(SecretCodec::new([7u8; 32]).is_ok());
    }

    #[test]
    fn test_encrypt_then_decrypt() {
        let codec = SecretCodec::new(KEY).unwrap();
        let stored = codec.encrypt("hunter2").unwrap();

        assert_ne!(stored, "hunter2");
        assert_eq!(codec.decrypt(&stored).unwrap().expose(), "hunter2");
    }

    #[test]
    fn test_each_encryption_uses_fresh_iv() {
        let codec = SecretCodec::new(KEY).unwrap();
        assert_ne!(codec.encrypt("same").unwrap(), codec.encrypt("same").unwrap());
    }

    #[test]
    fn test_empty_values_pass_through() {
        let codec = SecretCodec::new(KEY).unwrap();
        assert_eq!(codec.encrypt("").unwrap(), "");
        assert!(codec.decrypt("").unwrap().is_empty());
    }

    #[test]
    fn test_decrypt_rejects_malformed_input() {
        let codec = SecretCodec::new(KEY).unwrap();

        assert!(matches!(
            codec.decrypt("not base64 at all!"),
            Err(SecretError::Encoding(_))
        ));
        assert!(matches!(
            codec.decrypt(&URL_SAFE.encode([1u8; 8])),
            Err(SecretError::TooShort)
        ));
    }

    #[test]
    fn test_debug_is_redacted() {
        let secret = Secret::new("top-secret");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
    }
}
