//! Fuzz target for X3DH initial message decoding

#![no_main]

use kocmoc_crypto::x3dh::InitialMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = InitialMessage::from_bytes(data) {
        assert_eq!(message.to_bytes(), data);
    }
});
