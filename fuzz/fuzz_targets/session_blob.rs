//! Fuzz target for persisted session decoding
//!
//! Corrupt blobs must be rejected without panicking or allocating without
//! bound.

#![no_main]

use kocmoc_crypto::ratchet::RatchetState;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = RatchetState::from_bytes(data);
});
