//! Fuzz target for message envelope decoding
//!
//! The decoder must return Ok or Err for any input, and anything it accepts
//! must re-encode to the same bytes.

#![no_main]

use kocmoc_crypto::envelope::MessageEnvelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = MessageEnvelope::from_bytes(data) {
        assert_eq!(envelope.to_bytes().unwrap(), data);
    }
});
