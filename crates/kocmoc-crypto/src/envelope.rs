//! Message envelope wire format.
//!
//! All multi-byte fields are big-endian (network byte order).
//!
//! ```text
//! +---------+---------------+---------+---------+--------+-------+---------+------------+
//! | ver (1) | ratchet (32)  | pn (4)  | n (4)   | nonce  | tag   | len (4) | ciphertext |
//! |         |               |         |         | (24)   | (16)  |         | (len)      |
//! +---------+---------------+---------+---------+--------+-------+---------+------------+
//! |<------------- header (41 bytes) ------------>|
//! ```
//!
//! The header bytes double as associated data, so any change to them is
//! caught by the AEAD tag.

use crate::CryptoError;
use crate::aead::{NONCE_SIZE, Nonce, TAG_SIZE, Tag};
use crate::x25519::PublicKey;

/// Current wire version.
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Encoded header size.
pub const HEADER_SIZE: usize = 1 + 32 + 4 + 4;

/// Fixed overhead of an encoded envelope.
pub const ENVELOPE_OVERHEAD: usize = HEADER_SIZE + NONCE_SIZE + TAG_SIZE + 4;

/// Largest ciphertext accepted by the decoder (16 MiB).
pub const MAX_CIPHERTEXT_LEN: usize = 16 * 1024 * 1024;

/// Ratchet bookkeeping sent in the clear with every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Sender's current ratchet public key
    pub ratchet_key: PublicKey,
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Index of this message in the current sending chain
    pub counter: u32,
}

impl MessageHeader {
    /// Encode the header (also used as associated data).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = ENVELOPE_VERSION;
        out[1..33].copy_from_slice(self.ratchet_key.as_bytes());
        out[33..37].copy_from_slice(&self.previous_chain_length.to_be_bytes());
        out[37..41].copy_from_slice(&self.counter.to_be_bytes());
        out
    }

    /// Decode a header.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MalformedEnvelope`] if `bytes` is too short and
    /// [`CryptoError::UnsupportedVersion`] on an unknown version byte.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CryptoError::MalformedEnvelope);
        }
        if bytes[0] != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(bytes[0]));
        }

        Ok(Self {
            ratchet_key: PublicKey::from_bytes(read_array(&bytes[1..33])),
            previous_chain_length: u32::from_be_bytes(read_array(&bytes[33..37])),
            counter: u32::from_be_bytes(read_array(&bytes[37..41])),
        })
    }
}

/// Encrypted message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Cleartext, authenticated header
    pub header: MessageHeader,
    /// AEAD nonce
    pub nonce: Nonce,
    /// Encrypted payload
    pub ciphertext: Vec<u8>,
    /// AEAD tag
    pub tag: Tag,
}

impl MessageEnvelope {
    /// Total encoded size.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_OVERHEAD + self.ciphertext.len()
    }

    /// Encode to the versioned wire format.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MessageTooLarge`] if the ciphertext exceeds
    /// [`MAX_CIPHERTEXT_LEN`], which the decoder would reject.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        if self.ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(CryptoError::MessageTooLarge);
        }
        let len = u32::try_from(self.ciphertext.len()).map_err(|_| CryptoError::MessageTooLarge)?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(self.tag.as_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        Ok(out)
    }

    /// Decode from the versioned wire format.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedVersion`] for an unknown version and
    /// [`CryptoError::MalformedEnvelope`] for truncated input, trailing bytes
    /// or an oversized ciphertext.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.is_empty() {
            return Err(CryptoError::MalformedEnvelope);
        }
        if bytes[0] != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(bytes[0]));
        }
        if bytes.len() < ENVELOPE_OVERHEAD {
            return Err(CryptoError::MalformedEnvelope);
        }

        let header = MessageHeader::from_bytes(&bytes[..HEADER_SIZE])?;

        let mut offset = HEADER_SIZE;
        let nonce = Nonce::from_bytes(read_array(&bytes[offset..offset + NONCE_SIZE]));
        offset += NONCE_SIZE;
        let tag = Tag::from_bytes(read_array(&bytes[offset..offset + TAG_SIZE]));
        offset += TAG_SIZE;
        let len = u32::from_be_bytes(read_array(&bytes[offset..offset + 4])) as usize;
        offset += 4;

        if len > MAX_CIPHERTEXT_LEN || bytes.len() - offset != len {
            return Err(CryptoError::MalformedEnvelope);
        }

        Ok(Self {
            header,
            nonce,
            ciphertext: bytes[offset..].to_vec(),
            tag,
        })
    }
}

// Callers always pass a slice of exactly N bytes.
fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MessageEnvelope {
        MessageEnvelope {
            header: MessageHeader {
                ratchet_key: PublicKey::from_bytes([0x11; 32]),
                previous_chain_length: 3,
                counter: 0x0102_0304,
            },
            nonce: Nonce::from_bytes([0x22; NONCE_SIZE]),
            ciphertext: b"opaque".to_vec(),
            tag: Tag::from_bytes([0x33; TAG_SIZE]),
        }
    }

    #[test]
    fn test_envelope_layout() {
        let bytes = sample().to_bytes().unwrap();

        assert_eq!(bytes.len(), ENVELOPE_OVERHEAD + 6);
        assert_eq!(bytes[0], ENVELOPE_VERSION);
        assert_eq!(&bytes[33..37], &[0, 0, 0, 3]);
        assert_eq!(&bytes[37..41], &[1, 2, 3, 4]);
        assert_eq!(&bytes[bytes.len() - 6..], b"opaque");
    }

    #[test]
    fn test_envelope_decode() {
        let envelope = sample();
        assert_eq!(MessageEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap(), envelope);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = 0x02;

        assert_eq!(
            MessageEnvelope::from_bytes(&bytes),
            Err(CryptoError::UnsupportedVersion(0x02))
        );
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = sample().to_bytes().unwrap();

        for len in [0, 1, HEADER_SIZE, ENVELOPE_OVERHEAD - 1, bytes.len() - 1] {
            assert_eq!(
                MessageEnvelope::from_bytes(&bytes[..len]),
                Err(CryptoError::MalformedEnvelope),
                "length {len}"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes.push(0);

        assert_eq!(
            MessageEnvelope::from_bytes(&bytes),
            Err(CryptoError::MalformedEnvelope)
        );
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..256)) {
            let _ = MessageEnvelope::from_bytes(&bytes);
        }

        #[test]
        fn prop_single_bit_flip_in_length_rejected(bit in 0usize..32) {
            let mut bytes = sample().to_bytes().unwrap();
            let offset = HEADER_SIZE + NONCE_SIZE + TAG_SIZE;
            bytes[offset + bit / 8] ^= 1 << (bit % 8);
            proptest::prop_assert_eq!(
                MessageEnvelope::from_bytes(&bytes),
                Err(CryptoError::MalformedEnvelope)
            );
        }
    }

    #[test]
    fn test_oversized_ciphertext_not_encoded() {
        let mut envelope = sample();
        envelope.ciphertext = vec![0; MAX_CIPHERTEXT_LEN + 1];
        assert_eq!(envelope.to_bytes(), Err(CryptoError::MessageTooLarge));

        envelope.ciphertext.truncate(MAX_CIPHERTEXT_LEN);
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(MessageEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_empty_ciphertext_allowed() {
        let mut envelope = sample();
        envelope.ciphertext.clear();

        let decoded = MessageEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert!(decoded.ciphertext.is_empty());
    }
}
