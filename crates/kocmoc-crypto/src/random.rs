//! Secure random number generation.
//!
//! All key material and nonces come from the operating system CSPRNG. A
//! failing source is fatal for the caller: no key can be generated safely.

use crate::CryptoError;

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::fill(buf).map_err(|err| {
        tracing::error!("OS random source failed: {}", err);
        CryptoError::EntropySourceFailure
    })
}

/// Generate a random 32-byte array.
///
/// # Errors
///
/// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
pub fn random_32() -> Result<[u8; 32], CryptoError> {
    let mut buf = [0u8; 32];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random 24-byte array (one XChaCha20 nonce).
///
/// # Errors
///
/// Returns [`CryptoError::EntropySourceFailure`] if the OS CSPRNG fails.
pub fn random_24() -> Result<[u8; 24], CryptoError> {
    let mut buf = [0u8; 24];
    fill_random(&mut buf)?;
    Ok(buf)
}
