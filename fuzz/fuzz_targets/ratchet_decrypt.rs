//! Fuzz target for the receive path
//!
//! Feeds structured but attacker-chosen envelopes into a live responder
//! session. Every forgery must fail and leave the session able to decrypt
//! the genuine message afterwards.

#![no_main]

use arbitrary::Arbitrary;
use kocmoc_crypto::aead::{Nonce, Tag};
use kocmoc_crypto::config::{PreKeyConfig, SessionConfig};
use kocmoc_crypto::envelope::{MessageEnvelope, MessageHeader};
use kocmoc_crypto::keys::{LocalPreKeys, generate_identity};
use kocmoc_crypto::ratchet::RatchetState;
use kocmoc_crypto::x25519::PublicKey;
use kocmoc_crypto::x3dh;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Forgery {
    ratchet_key: [u8; 32],
    previous_chain_length: u32,
    counter: u32,
    nonce: [u8; 24],
    tag: [u8; 16],
    ciphertext: Vec<u8>,
}

fuzz_target!(|forgeries: Vec<Forgery>| {
    let alice = generate_identity().unwrap();
    let prekeys = PreKeyConfig {
        one_time_batch: 1,
        ..PreKeyConfig::default()
    };
    let config = SessionConfig {
        max_skip: 64,
        ..SessionConfig::default()
    };
    let mut bob = LocalPreKeys::new(generate_identity().unwrap(), 1, &prekeys).unwrap();
    let (secret, initial) = x3dh::initiate(&alice, &bob.bundle()).unwrap();
    let bob_secret = x3dh::respond(&mut bob, &initial).unwrap();

    let mut alice_session = RatchetState::seed(secret, config).unwrap();
    let mut bob_session = RatchetState::seed(bob_secret, config).unwrap();
    let genuine = alice_session.encrypt(b"genuine").unwrap();

    for forgery in forgeries.into_iter().take(16) {
        let envelope = MessageEnvelope {
            header: MessageHeader {
                ratchet_key: PublicKey::from_bytes(forgery.ratchet_key),
                previous_chain_length: forgery.previous_chain_length,
                counter: forgery.counter,
            },
            nonce: Nonce::from_bytes(forgery.nonce),
            ciphertext: forgery.ciphertext,
            tag: Tag::from_bytes(forgery.tag),
        };
        assert!(bob_session.decrypt(&envelope).is_err());
    }

    assert_eq!(bob_session.decrypt(&genuine).unwrap(), b"genuine");
});
