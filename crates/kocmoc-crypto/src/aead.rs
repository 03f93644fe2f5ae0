//! `XChaCha20-Poly1305` AEAD primitive.
//!
//! - 256-bit keys
//! - 192-bit nonces, safe to draw at random
//! - 128-bit detached authentication tags
//! - In-place encryption/decryption
//!
//! Message-level framing lives in [`crate::cipher`]; this module only wraps
//! the cipher itself.

use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{AeadInPlace, KeyInit},
};
use zeroize::ZeroizeOnDrop;

use crate::{CryptoError, random};

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Draw a fresh nonce from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
    pub fn random() -> Result<Self, CryptoError> {
        random::random_24().map(Self)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// Authentication tag (16 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag([u8; TAG_SIZE]);

impl Tag {
    /// Create a tag from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TAG_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TAG_SIZE] {
        &self.0
    }
}

/// AEAD encryption key (32 bytes), zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Encrypt in place, returning the detached authentication tag.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidState`] if the buffer exceeds the
    /// cipher's maximum message length.
    pub fn encrypt_in_place(
        &self,
        nonce: &Nonce,
        buffer: &mut [u8],
        aad: &[u8],
    ) -> Result<Tag, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        let tag = cipher
            .encrypt_in_place_detached(nonce.as_generic(), aad, buffer)
            .map_err(|_| CryptoError::InvalidState)?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);
        Ok(Tag(tag_bytes))
    }

    /// Decrypt in place, verifying the authentication tag first.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AuthenticationFailed`] on any failure.
    pub fn decrypt_in_place(
        &self,
        nonce: &Nonce,
        buffer: &mut [u8],
        tag: &Tag,
        aad: &[u8],
    ) -> Result<(), CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .decrypt_in_place_detached(
                nonce.as_generic(),
                aad,
                buffer,
                chacha20poly1305::Tag::from_slice(&tag.0),
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aead_in_place_roundtrip() {
        let key = AeadKey::new([0x42u8; 32]);
        let nonce = Nonce::random().unwrap();
        let plaintext = b"hello world";
        let mut buffer = plaintext.to_vec();

        let tag = key.encrypt_in_place(&nonce, &mut buffer, b"aad").unwrap();
        assert_ne!(&buffer[..], plaintext);

        key.decrypt_in_place(&nonce, &mut buffer, &tag, b"aad")
            .unwrap();
        assert_eq!(&buffer[..], plaintext);
    }

    #[test]
    fn test_aead_wrong_aad_fails() {
        let key = AeadKey::new([0x01u8; 32]);
        let nonce = Nonce::random().unwrap();
        let mut buffer = b"secret".to_vec();

        let tag = key.encrypt_in_place(&nonce, &mut buffer, b"aad1").unwrap();
        assert_eq!(
            key.decrypt_in_place(&nonce, &mut buffer, &tag, b"aad2"),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_aead_wrong_key_fails() {
        let key1 = AeadKey::new([0x01u8; 32]);
        let key2 = AeadKey::new([0x02u8; 32]);
        let nonce = Nonce::from_bytes([0u8; NONCE_SIZE]);
        let mut buffer = b"secret".to_vec();

        let tag = key1.encrypt_in_place(&nonce, &mut buffer, b"").unwrap();
        assert!(key2.decrypt_in_place(&nonce, &mut buffer, &tag, b"").is_err());
    }

    #[test]
    fn test_random_nonces_differ() {
        assert_ne!(Nonce::random().unwrap(), Nonce::random().unwrap());
    }
}
