//! X3DH asynchronous key agreement.
//!
//! ```text
//! Initiator (A)                                   Responder (B)
//!   fetch bundle {IK_B, SPK_B, sig, OPK_B?}
//!   verify sig(IK_B, SPK_B)
//!   EK_A <- random
//!   DH1 = DH(IK_A, SPK_B)                         DH1 = DH(SPK_B, IK_A)
//!   DH2 = DH(EK_A, IK_B)                          DH2 = DH(IK_B, EK_A)
//!   DH3 = DH(EK_A, SPK_B)                         DH3 = DH(SPK_B, EK_A)
//!   DH4 = DH(EK_A, OPK_B)   (if OPK offered)      DH4 = DH(OPK_B, EK_A)
//!   SK = HKDF(0xFF*32 || DH1 || DH2 || DH3 [|| DH4], "kocmoc-x3dh-v1")
//!   ---- InitialMessage {IK_A, EK_A, spk id, opk id} ---->
//! ```
//!
//! Both sides must concatenate in exactly this order with exactly this
//! label; a mismatch is not detected here and only shows up later as
//! authentication failures.

use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::CryptoError;
use crate::hash::hkdf;
use crate::keys::{IdentityKeyPair, IdentityPublicKey, LocalPreKeys, PreKeyBundle};
use crate::signatures::VerifyingKey;
use crate::x25519::{PrivateKey, PublicKey};

/// Domain separation label for the X3DH KDF.
const X3DH_INFO: &[u8] = b"kocmoc-x3dh-v1";

/// Curve25519 prefix block ("F" in the X3DH paper).
const KDF_PREFIX: [u8; 32] = [0xFF; 32];

/// Current initial message wire version.
pub const INITIAL_MESSAGE_VERSION: u8 = 0x01;

/// Associated data length: two identity agreement keys.
pub const ASSOCIATED_DATA_SIZE: usize = 64;

const INITIAL_MESSAGE_MIN_SIZE: usize = 1 + 32 + 32 + 32 + 4 + 1;

/// How the ratchet gets its first DH key pair.
#[derive(Clone, Debug)]
pub enum RatchetSeed {
    /// Initiator: the responder's signed pre-key is the first remote ratchet key
    Initiator {
        /// Responder's signed pre-key
        remote_ratchet_key: PublicKey,
    },
    /// Responder: its signed pre-key pair is the first local ratchet pair
    Responder {
        /// Signed pre-key private half
        local_ratchet_key: PrivateKey,
    },
}

/// Output of a completed handshake, consumed by
/// [`RatchetState::seed`](crate::ratchet::RatchetState::seed).
#[derive(ZeroizeOnDrop)]
pub struct HandshakeSecret {
    key: [u8; 32],
    #[zeroize(skip)]
    associated_data: [u8; ASSOCIATED_DATA_SIZE],
    #[zeroize(skip)]
    seed: RatchetSeed,
}

impl HandshakeSecret {
    /// Shared secret; becomes the first root key.
    #[must_use]
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// `IK_A || IK_B` agreement keys, bound into every message's AEAD.
    #[must_use]
    pub fn associated_data(&self) -> &[u8; ASSOCIATED_DATA_SIZE] {
        &self.associated_data
    }

    /// Ratchet key material for seeding.
    #[must_use]
    pub fn seed(&self) -> &RatchetSeed {
        &self.seed
    }
}

/// Cleartext fields the responder needs to finish the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitialMessage {
    /// Initiator identity
    pub identity: IdentityPublicKey,
    /// Initiator ephemeral key
    pub ephemeral_key: PublicKey,
    /// Signed pre-key used
    pub signed_prekey_id: u32,
    /// One-time pre-key used, if the bundle offered one
    pub one_time_prekey_id: Option<u32>,
}

impl InitialMessage {
    /// Encode to the versioned wire format.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INITIAL_MESSAGE_MIN_SIZE + 4);
        out.push(INITIAL_MESSAGE_VERSION);
        out.extend_from_slice(&self.identity.signing.to_bytes());
        out.extend_from_slice(self.identity.agreement.as_bytes());
        out.extend_from_slice(self.ephemeral_key.as_bytes());
        out.extend_from_slice(&self.signed_prekey_id.to_be_bytes());
        match self.one_time_prekey_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_be_bytes());
            }
            None => out.push(0),
        }
        out
    }

    /// Decode from the versioned wire format.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedVersion`] on an unknown version,
    /// [`CryptoError::MalformedEnvelope`] on bad framing and
    /// [`CryptoError::InvalidPublicKey`] if the signing key is not a valid point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let Some(&version) = bytes.first() else {
            return Err(CryptoError::MalformedEnvelope);
        };
        if version != INITIAL_MESSAGE_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        if bytes.len() < INITIAL_MESSAGE_MIN_SIZE {
            return Err(CryptoError::MalformedEnvelope);
        }

        let signing = VerifyingKey::from_bytes(&array_at(bytes, 1))?;
        let agreement = PublicKey::from_bytes(array_at(bytes, 33));
        let ephemeral_key = PublicKey::from_bytes(array_at(bytes, 65));
        let signed_prekey_id = u32::from_be_bytes(array_at(bytes, 97));

        let one_time_prekey_id = match (bytes[101], bytes.len()) {
            (0, INITIAL_MESSAGE_MIN_SIZE) => None,
            (1, len) if len == INITIAL_MESSAGE_MIN_SIZE + 4 => {
                Some(u32::from_be_bytes(array_at(bytes, 102)))
            }
            _ => return Err(CryptoError::MalformedEnvelope),
        };

        Ok(Self {
            identity: IdentityPublicKey { signing, agreement },
            ephemeral_key,
            signed_prekey_id,
            one_time_prekey_id,
        })
    }
}

fn array_at<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

fn derive_shared_secret(ikm: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    hkdf(b"", ikm, X3DH_INFO, &mut key);
    key
}

fn associated_data(
    initiator: &PublicKey,
    responder: &PublicKey,
) -> [u8; ASSOCIATED_DATA_SIZE] {
    let mut ad = [0u8; ASSOCIATED_DATA_SIZE];
    ad[..32].copy_from_slice(initiator.as_bytes());
    ad[32..].copy_from_slice(responder.as_bytes());
    ad
}

/// Start a session against a peer's published bundle.
///
/// # Errors
///
/// - [`CryptoError::SignatureInvalid`] if the bundle signature does not
///   verify; no key agreement is attempted.
/// - [`CryptoError::InvalidPublicKey`] if a bundle key is a low-order point.
/// - [`CryptoError::EntropySourceFailure`] if no ephemeral key can be drawn.
pub fn initiate(
    local: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<(HandshakeSecret, InitialMessage), CryptoError> {
    if let Err(err) = bundle.verify() {
        tracing::warn!(
            "Rejected pre-key bundle for device {}: {}",
            bundle.device_id,
            err
        );
        return Err(err);
    }

    let ephemeral = PrivateKey::random()?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));
    ikm.extend_from_slice(&KDF_PREFIX);
    ikm.extend_from_slice(local.agreement().exchange(&bundle.signed_prekey)?.as_bytes());
    ikm.extend_from_slice(ephemeral.exchange(&bundle.identity.agreement)?.as_bytes());
    ikm.extend_from_slice(ephemeral.exchange(&bundle.signed_prekey)?.as_bytes());
    if let Some(one_time) = &bundle.one_time_prekey {
        ikm.extend_from_slice(ephemeral.exchange(&one_time.key)?.as_bytes());
    }

    let local_public = local.public();
    let secret = HandshakeSecret {
        key: derive_shared_secret(&ikm),
        associated_data: associated_data(&local_public.agreement, &bundle.identity.agreement),
        seed: RatchetSeed::Initiator {
            remote_ratchet_key: bundle.signed_prekey,
        },
    };

    let message = InitialMessage {
        identity: local_public,
        ephemeral_key: ephemeral.public_key(),
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey_id: bundle.one_time_prekey.map(|k| k.id),
    };

    tracing::debug!(
        "X3DH initiated with device {} (spk {}, one-time {:?})",
        bundle.device_id,
        message.signed_prekey_id,
        message.one_time_prekey_id
    );

    Ok((secret, message))
}

/// Complete a session started by a peer's initial message.
///
/// The referenced one-time pre-key is removed from `local` only when the
/// derivation succeeded, within the same exclusive borrow.
///
/// # Errors
///
/// - [`CryptoError::UnknownSignedPreKey`] if the signed pre-key id is unknown.
/// - [`CryptoError::UnknownOneTimePreKey`] if the one-time pre-key was
///   consumed or never existed.
/// - [`CryptoError::InvalidPublicKey`] if a peer key is a low-order point.
pub fn respond(
    local: &mut LocalPreKeys,
    message: &InitialMessage,
) -> Result<HandshakeSecret, CryptoError> {
    let secret = {
        let signed = local
            .find_signed_prekey(message.signed_prekey_id)
            .ok_or(CryptoError::UnknownSignedPreKey)?;

        let one_time = match message.one_time_prekey_id {
            Some(id) => Some(local.one_time(id).ok_or_else(|| {
                tracing::warn!("Initial message references unknown one-time pre-key {}", id);
                CryptoError::UnknownOneTimePreKey
            })?),
            None => None,
        };

        let identity = local.identity();
        let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 5));
        ikm.extend_from_slice(&KDF_PREFIX);
        ikm.extend_from_slice(
            signed
                .private_key()
                .exchange(&message.identity.agreement)?
                .as_bytes(),
        );
        ikm.extend_from_slice(identity.agreement().exchange(&message.ephemeral_key)?.as_bytes());
        ikm.extend_from_slice(signed.private_key().exchange(&message.ephemeral_key)?.as_bytes());
        if let Some(one_time) = one_time {
            ikm.extend_from_slice(
                one_time
                    .private_key()
                    .exchange(&message.ephemeral_key)?
                    .as_bytes(),
            );
        }

        HandshakeSecret {
            key: derive_shared_secret(&ikm),
            associated_data: associated_data(
                &message.identity.agreement,
                &identity.public().agreement,
            ),
            seed: RatchetSeed::Responder {
                local_ratchet_key: signed.private_key().clone(),
            },
        }
    };

    if let Some(id) = message.one_time_prekey_id {
        local.take_one_time(id);
    }

    tracing::debug!(
        "X3DH completed for initiator {} (spk {}, one-time {:?})",
        message.identity.agreement.short_hex(),
        message.signed_prekey_id,
        message.one_time_prekey_id
    );

    Ok(secret)
}
