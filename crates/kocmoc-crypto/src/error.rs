//! Cryptographic error types.

use thiserror::Error;

/// Errors raised by key generation, the handshake, the ratchet and the
/// session store.
///
/// The set is closed so callers can match it exhaustively. Display strings
/// never carry secret-dependent detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Signed pre-key signature does not verify against the bundle identity
    #[error("signed pre-key signature invalid")]
    SignatureInvalid,

    /// Referenced one-time pre-key was consumed or never existed
    #[error("unknown one-time pre-key")]
    UnknownOneTimePreKey,

    /// Referenced signed pre-key is neither the current nor the previous one
    #[error("unknown signed pre-key")]
    UnknownSignedPreKey,

    /// Message could not be authenticated
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Message key for this counter was already used
    #[error("replayed message")]
    ReplayedMessage,

    /// Message would require skipping more keys than the configured bound
    #[error("too many skipped messages")]
    SkippedTooMany,

    /// The OS random source failed
    #[error("entropy source failure")]
    EntropySourceFailure,

    /// Peer public key is a low-order point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Operation not possible in the current session state
    #[error("invalid state for operation")]
    InvalidState,

    /// Sending counter exhausted, a new handshake is required
    #[error("message counter exhausted")]
    CounterExhausted,

    /// Wire structure carries an unknown version byte
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// Plaintext is larger than a single envelope can carry
    #[error("message too large")]
    MessageTooLarge,

    /// Wire structure is truncated or inconsistent
    #[error("malformed envelope")]
    MalformedEnvelope,

    /// Serialized key or session material could not be decoded
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// No session is registered under the requested id
    #[error("unknown session")]
    UnknownSession,
}

impl CryptoError {
    /// Whether the error should be reported to intrusion detection.
    #[must_use]
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid | Self::ReplayedMessage | Self::SkippedTooMany
        )
    }

    /// Whether the whole session has to be re-established.
    #[must_use]
    pub fn requires_new_session(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid
                | Self::UnknownOneTimePreKey
                | Self::UnknownSignedPreKey
                | Self::CounterExhausted
                | Self::EntropySourceFailure
        )
    }
}
