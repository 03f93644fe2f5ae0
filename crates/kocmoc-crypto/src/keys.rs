//! Identity keys, signed pre-keys, one-time pre-keys and published bundles.
//!
//! Private halves never leave this module except through explicit
//! `to_bytes` exports; storing them is the caller's responsibility.
//!
//! ```text
//! IdentityKeyPair ──signs──> SignedPreKey ─┐
//!                                          ├──> PreKeyBundle (public, published)
//! OneTimePreKey pool ─── lowest id ────────┘
//! ```

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::CryptoError;
use crate::config::PreKeyConfig;
use crate::signatures::{Signature, SigningKey, VerifyingKey};
use crate::x25519::{PrivateKey, PublicKey};

/// Domain label prefixed to every signed pre-key signature.
const SIGNED_PREKEY_LABEL: &[u8] = b"kocmoc-signed-prekey-v1";

/// Long-term device identity: an Ed25519 signing key and an X25519
/// agreement key.
#[derive(Clone, Debug)]
pub struct IdentityKeyPair {
    signing: SigningKey,
    agreement: PrivateKey,
}

/// Public half of an identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityPublicKey {
    /// Verifies signed pre-key signatures
    pub signing: VerifyingKey,
    /// Participates in X3DH agreement
    pub agreement: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new identity from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            signing: SigningKey::random()?,
            agreement: PrivateKey::random()?,
        })
    }

    /// Public half for publication.
    #[must_use]
    pub fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            signing: self.signing.verifying_key(),
            agreement: self.agreement.public_key(),
        }
    }

    /// Sign with the identity signing key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub(crate) fn agreement(&self) -> &PrivateKey {
        &self.agreement
    }

    /// Export `signing seed || agreement scalar` for an external key store.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<[u8; 64]> {
        let mut bytes = Zeroizing::new([0u8; 64]);
        bytes[..32].copy_from_slice(&Zeroizing::new(self.signing.to_bytes())[..]);
        bytes[32..].copy_from_slice(&Zeroizing::new(self.agreement.to_bytes())[..]);
        bytes
    }

    /// Import from the layout produced by [`IdentityKeyPair::to_bytes`].
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut signing = Zeroizing::new([0u8; 32]);
        let mut agreement = Zeroizing::new([0u8; 32]);
        signing.copy_from_slice(&bytes[..32]);
        agreement.copy_from_slice(&bytes[32..]);
        Self {
            signing: SigningKey::from_bytes(&signing),
            agreement: PrivateKey::from_bytes(*agreement),
        }
    }
}

/// Medium-term pre-key signed by the identity key.
#[derive(Clone, Debug)]
pub struct SignedPreKey {
    id: u32,
    key: PrivateKey,
    public: PublicKey,
    signature: Signature,
    created_at: u64,
}

impl SignedPreKey {
    /// Key id referenced by initial messages
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Public half
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Identity signature over the public half
    #[must_use]
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Creation time, seconds since the Unix epoch
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    /// Whether the key is older than `max_age_secs` at `now` (Unix seconds).
    #[must_use]
    pub fn is_expired(&self, now: u64, max_age_secs: u64) -> bool {
        now.saturating_sub(self.created_at) >= max_age_secs
    }

    /// Verify the signature against an identity public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureInvalid`] if it does not verify.
    pub fn verify(&self, identity: &IdentityPublicKey) -> Result<(), CryptoError> {
        identity.signing.verify(
            &signed_prekey_payload(self.id, &self.public),
            &self.signature,
        )
    }
}

/// Single-use pre-key.
#[derive(Clone, Debug)]
pub struct OneTimePreKey {
    id: u32,
    key: PrivateKey,
}

/// Public half of a one-time pre-key as published.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    /// Key id
    pub id: u32,
    /// Public key
    pub key: PublicKey,
}

impl OneTimePreKey {
    /// Key id
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Public half for publication
    #[must_use]
    pub fn public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            id: self.id,
            key: self.key.public_key(),
        }
    }

    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.key
    }
}

/// Public pre-key bundle served by the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Device the bundle belongs to
    pub device_id: u32,
    /// Device identity
    pub identity: IdentityPublicKey,
    /// Id of the signed pre-key
    pub signed_prekey_id: u32,
    /// Signed pre-key public half
    pub signed_prekey: PublicKey,
    /// Identity signature over the signed pre-key
    pub signed_prekey_signature: Signature,
    /// At most one one-time pre-key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

impl PreKeyBundle {
    /// Verify the signed pre-key signature against the bundle identity.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureInvalid`] if it does not verify.
    pub fn verify(&self) -> Result<(), CryptoError> {
        self.identity.signing.verify(
            &signed_prekey_payload(self.signed_prekey_id, &self.signed_prekey),
            &self.signed_prekey_signature,
        )
    }
}

fn signed_prekey_payload(id: u32, public: &PublicKey) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SIGNED_PREKEY_LABEL.len() + 4 + 32);
    payload.extend_from_slice(SIGNED_PREKEY_LABEL);
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(public.as_bytes());
    payload
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generate a fresh identity key pair.
///
/// # Errors
///
/// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
pub fn generate_identity() -> Result<IdentityKeyPair, CryptoError> {
    IdentityKeyPair::generate()
}

/// Generate a signed pre-key under `identity`.
///
/// # Errors
///
/// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
pub fn generate_signed_prekey(
    identity: &IdentityKeyPair,
    id: u32,
) -> Result<SignedPreKey, CryptoError> {
    let key = PrivateKey::random()?;
    let public = key.public_key();
    let signature = identity.sign(&signed_prekey_payload(id, &public));

    Ok(SignedPreKey {
        id,
        key,
        public,
        signature,
        created_at: unix_now(),
    })
}

/// Generate `count` one-time pre-keys with ids starting at `start_id`.
///
/// # Errors
///
/// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
pub fn generate_one_time_prekeys(
    start_id: u32,
    count: u32,
) -> Result<Vec<OneTimePreKey>, CryptoError> {
    (0..count)
        .map(|offset| {
            Ok(OneTimePreKey {
                id: start_id.wrapping_add(offset),
                key: PrivateKey::random()?,
            })
        })
        .collect()
}

/// Responder-side pre-key pool owned by one device.
#[derive(Debug)]
pub struct LocalPreKeys {
    identity: IdentityKeyPair,
    device_id: u32,
    signed: SignedPreKey,
    previous_signed: Option<SignedPreKey>,
    one_time: BTreeMap<u32, OneTimePreKey>,
    next_one_time_id: u32,
}

impl LocalPreKeys {
    /// Build a pool with a first signed pre-key and one batch of one-time keys.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
    pub fn new(
        identity: IdentityKeyPair,
        device_id: u32,
        config: &PreKeyConfig,
    ) -> Result<Self, CryptoError> {
        let signed = generate_signed_prekey(&identity, 1)?;
        let mut pool = Self {
            identity,
            device_id,
            signed,
            previous_signed: None,
            one_time: BTreeMap::new(),
            next_one_time_id: 1,
        };
        pool.replenish(config.one_time_batch as usize)?;
        Ok(pool)
    }

    /// Device identity
    #[must_use]
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// Device id published in bundles
    #[must_use]
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Current signed pre-key
    #[must_use]
    pub fn signed_prekey(&self) -> &SignedPreKey {
        &self.signed
    }

    /// Current or previous signed pre-key with this id.
    #[must_use]
    pub fn find_signed_prekey(&self, id: u32) -> Option<&SignedPreKey> {
        if self.signed.id == id {
            return Some(&self.signed);
        }
        self.previous_signed.as_ref().filter(|spk| spk.id == id)
    }

    /// Replace the signed pre-key. The old one stays valid as "previous"
    /// until the next rotation so in-flight handshakes still complete.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
    pub fn rotate_signed_prekey(&mut self) -> Result<(), CryptoError> {
        let next = generate_signed_prekey(&self.identity, self.signed.id.wrapping_add(1))?;
        let old = std::mem::replace(&mut self.signed, next);
        tracing::debug!(
            "Rotated signed pre-key {} -> {}",
            old.id,
            self.signed.id
        );
        self.previous_signed = Some(old);
        Ok(())
    }

    /// Whether the current signed pre-key has outlived `config`.
    #[must_use]
    pub fn needs_rotation(&self, config: &PreKeyConfig) -> bool {
        self.signed
            .is_expired(unix_now(), config.signed_prekey_max_age_secs)
    }

    /// Top the one-time pool up to `target` keys; returns how many were added.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
    pub fn replenish(&mut self, target: usize) -> Result<usize, CryptoError> {
        let missing = target.saturating_sub(self.one_time.len());
        let fresh = generate_one_time_prekeys(self.next_one_time_id, missing as u32)?;
        self.next_one_time_id = self.next_one_time_id.wrapping_add(missing as u32);
        for key in fresh {
            self.one_time.insert(key.id, key);
        }
        Ok(missing)
    }

    /// Number of unconsumed one-time pre-keys
    #[must_use]
    pub fn one_time_count(&self) -> usize {
        self.one_time.len()
    }

    /// Public halves of every unconsumed one-time pre-key, for upload.
    #[must_use]
    pub fn published_one_time_keys(&self) -> Vec<OneTimePreKeyPublic> {
        self.one_time.values().map(OneTimePreKey::public).collect()
    }

    pub(crate) fn one_time(&self, id: u32) -> Option<&OneTimePreKey> {
        self.one_time.get(&id)
    }

    /// Remove a one-time pre-key from the pool.
    pub fn take_one_time(&mut self, id: u32) -> Option<OneTimePreKey> {
        self.one_time.remove(&id)
    }

    /// Bundle offering the lowest-id unconsumed one-time pre-key, if any.
    #[must_use]
    pub fn bundle(&self) -> PreKeyBundle {
        let mut bundle = self.bundle_without_one_time();
        bundle.one_time_prekey = self.one_time.values().next().map(OneTimePreKey::public);
        bundle
    }

    /// Bundle with no one-time pre-key (exhausted pool fallback).
    #[must_use]
    pub fn bundle_without_one_time(&self) -> PreKeyBundle {
        PreKeyBundle {
            device_id: self.device_id,
            identity: self.identity.public(),
            signed_prekey_id: self.signed.id,
            signed_prekey: self.signed.public,
            signed_prekey_signature: self.signed.signature,
            one_time_prekey: None,
        }
    }
}
