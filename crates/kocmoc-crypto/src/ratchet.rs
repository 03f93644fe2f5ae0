//! Double Ratchet session state.
//!
//! Combines a symmetric ratchet (one chain key step per message) with a DH
//! ratchet (fresh X25519 pair every time the peer announces a new ratchet
//! key):
//!
//! ```text
//!            root_key
//!               |
//!   DH(local, remote') --KDF_RK--> root_key', receiving chain
//!   DH(local', remote') --KDF_RK--> root_key'', sending chain
//!
//!   chain_key[n] --expand("message")--> message_key[n]
//!   chain_key[n] --expand("chain")----> chain_key[n+1]
//! ```
//!
//! Root and chain keys are overwritten in place on every step and zeroized
//! when dropped. Decryption runs on a staged copy of the state and only
//! commits once the message authenticated, so a forged or corrupted
//! envelope never moves the session.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::CryptoError;
use crate::aead::AeadKey;
use crate::cipher;
use crate::config::SessionConfig;
use crate::envelope::{HEADER_SIZE, MAX_CIPHERTEXT_LEN, MessageEnvelope, MessageHeader};
use crate::hash::{hkdf, hkdf_expand};
use crate::x25519::{PrivateKey, PublicKey};
use crate::x3dh::{ASSOCIATED_DATA_SIZE, HandshakeSecret, RatchetSeed};

const ROOT_INFO: &[u8] = b"kocmoc-ratchet-root-v1";
const MESSAGE_INFO: &[u8] = b"kocmoc-ratchet-message-v1";
const CHAIN_INFO: &[u8] = b"kocmoc-ratchet-chain-v1";

/// Persisted session format version.
pub const STATE_VERSION: u8 = 0x01;

const MESSAGE_AD_SIZE: usize = ASSOCIATED_DATA_SIZE + HEADER_SIZE;

/// Chain key for symmetric ratcheting
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Ratchet forward and derive the message key for the current index.
    ///
    /// The chain key is replaced by its successor; the old value cannot be
    /// recovered from the new one.
    pub fn ratchet(&mut self) -> MessageKey {
        let mut message = MessageKey([0u8; 32]);
        hkdf_expand(&self.0, MESSAGE_INFO, &mut message.0);

        let mut next = Zeroizing::new([0u8; 32]);
        hkdf_expand(&self.0, CHAIN_INFO, &mut next[..]);
        self.0.copy_from_slice(&next[..]);

        message
    }

    /// Get the raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChainKey([REDACTED])")
    }
}

/// Single-use message key derived from a chain key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    /// Get the raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn to_aead_key(&self) -> AeadKey {
        AeadKey::new(self.0)
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageKey([REDACTED])")
    }
}

/// Skipped message keys are addressed by the ratchet key that produced
/// them and their counter in that chain.
type SkippedKeyId = ([u8; 32], u32);

/// Per-conversation Double Ratchet state machine.
#[derive(Clone)]
pub struct RatchetState {
    root_key: [u8; 32],
    sending_chain: Option<ChainKey>,
    receiving_chain: Option<ChainKey>,
    sending_index: u32,
    receiving_index: u32,
    previous_sending_length: u32,
    local_ratchet: PrivateKey,
    remote_ratchet: Option<PublicKey>,
    skipped: HashMap<SkippedKeyId, MessageKey>,
    /// Cached ids, oldest first
    skipped_order: VecDeque<SkippedKeyId>,
    retired_remote_keys: VecDeque<PublicKey>,
    associated_data: [u8; ASSOCIATED_DATA_SIZE],
    config: SessionConfig,
}

impl RatchetState {
    fn empty(
        root_key: [u8; 32],
        associated_data: [u8; ASSOCIATED_DATA_SIZE],
        local_ratchet: PrivateKey,
        config: SessionConfig,
    ) -> Self {
        Self {
            root_key,
            sending_chain: None,
            receiving_chain: None,
            sending_index: 0,
            receiving_index: 0,
            previous_sending_length: 0,
            local_ratchet,
            remote_ratchet: None,
            skipped: HashMap::new(),
            skipped_order: VecDeque::new(),
            retired_remote_keys: VecDeque::new(),
            associated_data,
            config,
        }
    }

    /// Seed a session from a completed X3DH handshake.
    ///
    /// The initiator can send immediately. The responder has no sending
    /// chain until the first incoming message triggers a DH ratchet step.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::EntropySourceFailure`] if no ratchet key can be drawn.
    /// - [`CryptoError::InvalidPublicKey`] if the peer's signed pre-key is a
    ///   low-order point.
    pub fn seed(secret: HandshakeSecret, config: SessionConfig) -> Result<Self, CryptoError> {
        match secret.seed() {
            RatchetSeed::Initiator { remote_ratchet_key } => {
                let local = PrivateKey::random()?;
                let mut state =
                    Self::empty(*secret.key(), *secret.associated_data(), local, config);

                let dh = state.local_ratchet.exchange(remote_ratchet_key)?;
                state.sending_chain = Some(state.kdf_root(dh.as_bytes()));
                state.remote_ratchet = Some(*remote_ratchet_key);

                tracing::debug!(
                    "Seeded initiator session (local ratchet {}, remote ratchet {})",
                    state.local_ratchet.public_key().short_hex(),
                    remote_ratchet_key.short_hex()
                );
                Ok(state)
            }
            RatchetSeed::Responder { local_ratchet_key } => {
                let state = Self::empty(
                    *secret.key(),
                    *secret.associated_data(),
                    local_ratchet_key.clone(),
                    config,
                );
                tracing::debug!(
                    "Seeded responder session (local ratchet {})",
                    state.local_ratchet.public_key().short_hex()
                );
                Ok(state)
            }
        }
    }

    /// Encrypt a message and advance the sending chain.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidState`] if no sending chain exists yet
    ///   (responder before its first received message).
    /// - [`CryptoError::CounterExhausted`] once the chain reached `u32::MAX`.
    /// - [`CryptoError::MessageTooLarge`] if the plaintext exceeds
    ///   [`MAX_CIPHERTEXT_LEN`].
    /// - [`CryptoError::EntropySourceFailure`] if no nonce can be drawn.
    ///
    /// The state is unchanged on error.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<MessageEnvelope, CryptoError> {
        if self.sending_chain.is_none() {
            return Err(CryptoError::InvalidState);
        }
        if self.sending_index == u32::MAX {
            return Err(CryptoError::CounterExhausted);
        }
        // Ciphertext length equals plaintext length; the tag travels apart
        if plaintext.len() > MAX_CIPHERTEXT_LEN {
            return Err(CryptoError::MessageTooLarge);
        }

        let header = MessageHeader {
            ratchet_key: self.local_ratchet.public_key(),
            previous_chain_length: self.previous_sending_length,
            counter: self.sending_index,
        };
        let aad = self.message_aad(&header);

        let chain = self
            .sending_chain
            .as_mut()
            .ok_or(CryptoError::InvalidState)?;
        let mut next = chain.clone();
        let message_key = next.ratchet();
        let (nonce, ciphertext, tag) = cipher::encrypt(&message_key, &aad, plaintext)?;

        *chain = next;
        self.sending_index += 1;

        tracing::trace!("Sent message {} on chain {}", header.counter, header.ratchet_key.short_hex());

        Ok(MessageEnvelope {
            header,
            nonce,
            ciphertext,
            tag,
        })
    }

    /// Decrypt an incoming envelope.
    ///
    /// Handles out-of-order delivery through the skipped-key cache and runs
    /// a DH ratchet step when the header announces a new ratchet key.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::AuthenticationFailed`] if the message does not
    ///   authenticate.
    /// - [`CryptoError::ReplayedMessage`] if its key was already used.
    /// - [`CryptoError::SkippedTooMany`] if accepting it would cache more
    ///   than `max_skip` keys.
    ///
    /// The state is unchanged on error.
    pub fn decrypt(&mut self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CryptoError> {
        let header = &envelope.header;
        let aad = self.message_aad(header);
        let id = (header.ratchet_key.to_bytes(), header.counter);

        if let Some(key) = self.skipped.get(&id) {
            let plaintext =
                cipher::decrypt(key, &aad, &envelope.nonce, &envelope.ciphertext, &envelope.tag)?;
            self.forget_skipped(&id);
            tracing::trace!(
                "Used skipped key {} on chain {}",
                header.counter,
                header.ratchet_key.short_hex()
            );
            return Ok(plaintext);
        }

        let mut staged = self.clone();
        let plaintext = staged
            .decrypt_staged(envelope, &aad)
            .map_err(|err| match err {
                // A low-order ratchet key in a header is a forgery
                CryptoError::InvalidPublicKey => CryptoError::AuthenticationFailed,
                other => other,
            })?;
        *self = staged;
        Ok(plaintext)
    }

    fn decrypt_staged(
        &mut self,
        envelope: &MessageEnvelope,
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let header = &envelope.header;

        if self.remote_ratchet != Some(header.ratchet_key) {
            if self.retired_remote_keys.contains(&header.ratchet_key) {
                tracing::warn!(
                    "Rejected message {} on retired chain {}",
                    header.counter,
                    header.ratchet_key.short_hex()
                );
                return Err(CryptoError::ReplayedMessage);
            }
            self.skip_message_keys(header.previous_chain_length)?;
            self.dh_ratchet(&header.ratchet_key)?;
        }

        if header.counter < self.receiving_index {
            tracing::warn!(
                "Rejected replayed message {} on chain {}",
                header.counter,
                header.ratchet_key.short_hex()
            );
            return Err(CryptoError::ReplayedMessage);
        }
        self.skip_message_keys(header.counter)?;

        let chain = self
            .receiving_chain
            .as_mut()
            .ok_or(CryptoError::InvalidState)?;
        let message_key = chain.ratchet();
        self.receiving_index = self
            .receiving_index
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)?;

        let plaintext = cipher::decrypt(
            &message_key,
            aad,
            &envelope.nonce,
            &envelope.ciphertext,
            &envelope.tag,
        )?;

        tracing::trace!(
            "Received message {} on chain {}",
            header.counter,
            header.ratchet_key.short_hex()
        );
        Ok(plaintext)
    }

    /// Cache receiving-chain keys up to (excluding) `until`.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), CryptoError> {
        let Some(chain) = self.receiving_chain.as_mut() else {
            return Ok(());
        };
        if until <= self.receiving_index {
            return Ok(());
        }

        let gap = (until - self.receiving_index) as usize;
        let max_skip = self.config.max_skip as usize;
        if gap > max_skip {
            tracing::warn!("Refusing to skip {} message keys (limit {})", gap, max_skip);
            return Err(CryptoError::SkippedTooMany);
        }

        let remote = self.remote_ratchet.ok_or(CryptoError::InvalidState)?;
        while self.receiving_index < until {
            let id = (remote.to_bytes(), self.receiving_index);
            self.skipped.insert(id, chain.ratchet());
            self.skipped_order.push_back(id);
            self.receiving_index += 1;
        }

        let mut evicted = 0usize;
        while self.skipped.len() > max_skip {
            let Some(oldest) = self.skipped_order.pop_front() else {
                break;
            };
            if self.skipped.remove(&oldest).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!("Evicted {} oldest skipped message keys", evicted);
        }
        Ok(())
    }

    fn forget_skipped(&mut self, id: &SkippedKeyId) {
        self.skipped.remove(id);
        self.skipped_order.retain(|cached| cached != id);
    }

    fn dh_ratchet(&mut self, remote: &PublicKey) -> Result<(), CryptoError> {
        if let Some(old) = self.remote_ratchet.replace(*remote) {
            self.retire(old);
        }
        self.previous_sending_length = self.sending_index;
        self.sending_index = 0;
        self.receiving_index = 0;

        let dh = self.local_ratchet.exchange(remote)?;
        self.receiving_chain = Some(self.kdf_root(dh.as_bytes()));

        self.local_ratchet = PrivateKey::random()?;
        let dh = self.local_ratchet.exchange(remote)?;
        self.sending_chain = Some(self.kdf_root(dh.as_bytes()));

        tracing::debug!(
            "DH ratchet step (remote {}, local {}, previous chain {})",
            remote.short_hex(),
            self.local_ratchet.public_key().short_hex(),
            self.previous_sending_length
        );
        Ok(())
    }

    fn retire(&mut self, key: PublicKey) {
        if self.config.max_retired_ratchet_keys == 0 {
            return;
        }
        self.retired_remote_keys.push_back(key);
        while self.retired_remote_keys.len() > self.config.max_retired_ratchet_keys {
            let Some(dropped) = self.retired_remote_keys.pop_front() else {
                break;
            };
            // Messages on a forgotten chain can no longer be told from replays
            let dropped = dropped.to_bytes();
            self.skipped.retain(|(ratchet_key, _), _| *ratchet_key != dropped);
            self.skipped_order.retain(|(ratchet_key, _)| *ratchet_key != dropped);
        }
    }

    /// `KDF_RK`: overwrite the root key and return the new chain key.
    fn kdf_root(&mut self, dh_output: &[u8; 32]) -> ChainKey {
        let mut output = Zeroizing::new([0u8; 64]);
        hkdf(&self.root_key, dh_output, ROOT_INFO, &mut output[..]);
        self.root_key.copy_from_slice(&output[..32]);

        let mut chain = [0u8; 32];
        chain.copy_from_slice(&output[32..]);
        ChainKey(chain)
    }

    fn message_aad(&self, header: &MessageHeader) -> [u8; MESSAGE_AD_SIZE] {
        let mut aad = [0u8; MESSAGE_AD_SIZE];
        aad[..ASSOCIATED_DATA_SIZE].copy_from_slice(&self.associated_data);
        aad[ASSOCIATED_DATA_SIZE..].copy_from_slice(&header.to_bytes());
        aad
    }

    /// Index of the next message to send
    #[must_use]
    pub fn sending_index(&self) -> u32 {
        self.sending_index
    }

    /// Index of the next expected message on the receiving chain
    #[must_use]
    pub fn receiving_index(&self) -> u32 {
        self.receiving_index
    }

    /// Number of cached skipped message keys
    #[must_use]
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Current local ratchet public key
    #[must_use]
    pub fn local_ratchet_key(&self) -> PublicKey {
        self.local_ratchet.public_key()
    }

    /// Last ratchet key announced by the peer
    #[must_use]
    pub fn remote_ratchet_key(&self) -> Option<PublicKey> {
        self.remote_ratchet
    }

    /// Whether [`RatchetState::encrypt`] can currently succeed
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.sending_chain.is_some() && self.sending_index < u32::MAX
    }

    /// Identity binding mixed into every message's associated data
    #[must_use]
    pub fn associated_data(&self) -> &[u8; ASSOCIATED_DATA_SIZE] {
        &self.associated_data
    }

    /// Serialize for persistence: `version || bincode(snapshot)`.
    ///
    /// The output holds live key material and is zeroized on drop.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        // Oldest first, so eviction order survives a restore
        let skipped: Vec<SkippedEntry> = self
            .skipped_order
            .iter()
            .filter_map(|id| {
                self.skipped.get(id).map(|key| SkippedEntry {
                    ratchet_key: id.0,
                    counter: id.1,
                    message_key: *key.as_bytes(),
                })
            })
            .collect();

        let snapshot = StateSnapshot {
            root_key: self.root_key,
            sending_chain: self.sending_chain.as_ref().map(|c| *c.as_bytes()),
            receiving_chain: self.receiving_chain.as_ref().map(|c| *c.as_bytes()),
            sending_index: self.sending_index,
            receiving_index: self.receiving_index,
            previous_sending_length: self.previous_sending_length,
            local_ratchet: self.local_ratchet.to_bytes(),
            remote_ratchet: self.remote_ratchet.map(|k| k.to_bytes()),
            skipped,
            retired_remote_keys: self.retired_remote_keys.iter().map(PublicKey::to_bytes).collect(),
            associated_data: self.associated_data.to_vec(),
            config: self.config,
        };

        let size = bincode::serialized_size(&snapshot)
            .map_err(|_| CryptoError::InvalidKeyMaterial)? as usize;
        let mut out = Zeroizing::new(Vec::with_capacity(1 + size));
        out.push(STATE_VERSION);
        bincode::serialize_into(&mut *out, &snapshot).map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Ok(out)
    }

    /// Restore a session serialized by [`RatchetState::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedVersion`] for an unknown version
    /// byte and [`CryptoError::InvalidKeyMaterial`] for anything that does
    /// not decode to a consistent state.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let Some((&version, body)) = bytes.split_first() else {
            return Err(CryptoError::InvalidKeyMaterial);
        };
        if version != STATE_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }

        let snapshot: StateSnapshot =
            bincode::deserialize(body).map_err(|_| CryptoError::InvalidKeyMaterial)?;

        let associated_data: [u8; ASSOCIATED_DATA_SIZE] = snapshot
            .associated_data
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        if snapshot.skipped.len() > snapshot.config.max_skip as usize {
            return Err(CryptoError::InvalidKeyMaterial);
        }

        Ok(Self {
            root_key: snapshot.root_key,
            sending_chain: snapshot.sending_chain.map(ChainKey),
            receiving_chain: snapshot.receiving_chain.map(ChainKey),
            sending_index: snapshot.sending_index,
            receiving_index: snapshot.receiving_index,
            previous_sending_length: snapshot.previous_sending_length,
            local_ratchet: PrivateKey::from_bytes(snapshot.local_ratchet),
            remote_ratchet: snapshot.remote_ratchet.map(PublicKey::from_bytes),
            skipped: snapshot
                .skipped
                .iter()
                .map(|entry| {
                    (
                        (entry.ratchet_key, entry.counter),
                        MessageKey(entry.message_key),
                    )
                })
                .collect(),
            skipped_order: snapshot
                .skipped
                .iter()
                .map(|entry| (entry.ratchet_key, entry.counter))
                .collect(),
            retired_remote_keys: snapshot
                .retired_remote_keys
                .iter()
                .copied()
                .map(PublicKey::from_bytes)
                .collect(),
            associated_data,
            config: snapshot.config,
        })
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        // Chain and message keys zeroize themselves
        self.skipped.clear();
        self.skipped_order.clear();
    }
}

impl fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetState")
            .field("sending_index", &self.sending_index)
            .field("receiving_index", &self.receiving_index)
            .field("previous_sending_length", &self.previous_sending_length)
            .field("local_ratchet", &self.local_ratchet.public_key())
            .field("remote_ratchet", &self.remote_ratchet)
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize, Zeroize)]
struct SkippedEntry {
    ratchet_key: [u8; 32],
    counter: u32,
    message_key: [u8; 32],
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StateSnapshot {
    root_key: [u8; 32],
    sending_chain: Option<[u8; 32]>,
    receiving_chain: Option<[u8; 32]>,
    sending_index: u32,
    receiving_index: u32,
    previous_sending_length: u32,
    local_ratchet: [u8; 32],
    remote_ratchet: Option<[u8; 32]>,
    skipped: Vec<SkippedEntry>,
    retired_remote_keys: Vec<[u8; 32]>,
    associated_data: Vec<u8>,
    #[zeroize(skip)]
    config: SessionConfig,
}
