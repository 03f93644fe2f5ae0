//! # Kocmoc Crypto
//!
//! End-to-end encryption core for Kocmoc messaging.
//!
//! This crate provides:
//! - Identity, signed and one-time pre-keys with published bundles
//! - X3DH asynchronous key agreement
//! - Double Ratchet sessions with bounded out-of-order delivery
//! - Per-message `XChaCha20-Poly1305` encryption with authenticated headers
//! - A concurrent session store with per-session exclusive access
//!
//! Transport, account lifecycle and ciphertext storage are left to the host.
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Agreement | X25519 | 128-bit |
//! | Pre-key Signatures | Ed25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash | BLAKE3 | 128-bit collision |
//! | KDF | HKDF-BLAKE3 | 128-bit |
//!
//! ## Example
//!
//! ```
//! use kocmoc_crypto::config::{PreKeyConfig, SessionConfig};
//! use kocmoc_crypto::keys::{LocalPreKeys, generate_identity};
//! use kocmoc_crypto::ratchet::RatchetState;
//! use kocmoc_crypto::x3dh;
//!
//! let alice = generate_identity()?;
//! let mut bob = LocalPreKeys::new(generate_identity()?, 1, &PreKeyConfig::default())?;
//!
//! let (secret, initial) = x3dh::initiate(&alice, &bob.bundle())?;
//! let mut alice_session = RatchetState::seed(secret, SessionConfig::default())?;
//! let mut bob_session = RatchetState::seed(x3dh::respond(&mut bob, &initial)?, SessionConfig::default())?;
//!
//! let envelope = alice_session.encrypt(b"hi")?;
//! assert_eq!(bob_session.decrypt(&envelope)?, b"hi");
//! # Ok::<(), kocmoc_crypto::CryptoError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod cipher;
pub mod config;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod keys;
pub mod random;
pub mod ratchet;
pub mod session;
pub mod signatures;
pub mod x25519;
pub mod x3dh;

pub use error::CryptoError;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;
