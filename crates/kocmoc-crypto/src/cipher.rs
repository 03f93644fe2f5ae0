//! Per-message authenticated encryption.
//!
//! Each message key encrypts exactly one message. The associated data is
//! the session's identity binding followed by the encoded
//! [`MessageHeader`](crate::envelope::MessageHeader): the header stays
//! readable for routing and ratchet bookkeeping but cannot be altered.
//!
//! Decryption has a single failure mode, [`CryptoError::AuthenticationFailed`],
//! whether the key is wrong or the data was tampered with. Both cases run
//! the same Poly1305 verification before any plaintext is produced.

use zeroize::Zeroizing;

use crate::CryptoError;
use crate::aead::{Nonce, Tag};
use crate::ratchet::MessageKey;

/// Encrypt `plaintext` under a single-use message key.
///
/// # Errors
///
/// Returns [`CryptoError::EntropySourceFailure`] if no nonce can be drawn.
pub fn encrypt(
    key: &MessageKey,
    associated_data: &[u8],
    plaintext: &[u8],
) -> Result<(Nonce, Vec<u8>, Tag), CryptoError> {
    let nonce = Nonce::random()?;
    let mut buffer = plaintext.to_vec();
    let tag = key
        .to_aead_key()
        .encrypt_in_place(&nonce, &mut buffer, associated_data)?;
    Ok((nonce, buffer, tag))
}

/// Decrypt and authenticate a message.
///
/// # Errors
///
/// Returns [`CryptoError::AuthenticationFailed`] on any failure; the
/// working buffer is zeroized so no partial plaintext survives.
pub fn decrypt(
    key: &MessageKey,
    associated_data: &[u8],
    nonce: &Nonce,
    ciphertext: &[u8],
    tag: &Tag,
) -> Result<Vec<u8>, CryptoError> {
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    key.to_aead_key()
        .decrypt_in_place(nonce, &mut buffer, tag, associated_data)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(std::mem::take(&mut *buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratchet::ChainKey;

    fn message_key(seed: u8) -> MessageKey {
        ChainKey::from_bytes([seed; 32]).ratchet()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = message_key(1);
        let (nonce, ciphertext, tag) = encrypt(&key, b"header", b"hello").unwrap();

        assert_ne!(&ciphertext[..], b"hello");
        assert_eq!(decrypt(&key, b"header", &nonce, &ciphertext, &tag).unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_key_and_tamper_are_indistinguishable() {
        let key = message_key(1);
        let (nonce, mut ciphertext, tag) = encrypt(&key, b"header", b"hello").unwrap();

        let wrong_key = decrypt(&message_key(2), b"header", &nonce, &ciphertext, &tag);
        ciphertext[0] ^= 0x01;
        let tampered = decrypt(&key, b"header", &nonce, &ciphertext, &tag);

        assert_eq!(wrong_key, Err(CryptoError::AuthenticationFailed));
        assert_eq!(tampered, wrong_key);
    }

    #[test]
    fn test_header_is_authenticated() {
        let key = message_key(3);
        let (nonce, ciphertext, tag) = encrypt(&key, b"header-a", b"hello").unwrap();

        assert_eq!(
            decrypt(&key, b"header-b", &nonce, &ciphertext, &tag),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_tag_tamper_detected() {
        let key = message_key(4);
        let (nonce, ciphertext, tag) = encrypt(&key, b"", b"payload").unwrap();

        let mut bad = *tag.as_bytes();
        bad[15] ^= 0x80;

        assert!(decrypt(&key, b"", &nonce, &ciphertext, &Tag::from_bytes(bad)).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = message_key(5);
        let (nonce, ciphertext, tag) = encrypt(&key, b"h", b"").unwrap();

        assert!(ciphertext.is_empty());
        assert!(decrypt(&key, b"h", &nonce, &ciphertext, &tag).unwrap().is_empty());
    }
}
