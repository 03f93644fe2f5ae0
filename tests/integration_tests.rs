//! End-to-end tests: handshake, ratchet, wire format and session store
//! working together.

use std::sync::Arc;
use std::thread;

use kocmoc_crypto::CryptoError;
use kocmoc_crypto::aead::Nonce;
use kocmoc_crypto::config::SessionConfig;
use kocmoc_crypto::envelope::{HEADER_SIZE, MessageEnvelope};
use kocmoc_crypto::keys::{LocalPreKeys, PreKeyBundle, generate_identity, generate_signed_prekey};
use kocmoc_crypto::ratchet::{ChainKey, RatchetState};
use kocmoc_crypto::session::SessionStore;
use kocmoc_crypto::x3dh;
use kocmoc_integration_tests::{conversation, conversation_with, small_prekeys};

// ============================================================================
// Round trip
// ============================================================================

#[test]
fn test_round_trip_over_the_wire() {
    let mut c = conversation();

    for i in 0..5u8 {
        let wire = c.alice.encrypt(&[i; 100]).unwrap().to_bytes().unwrap();
        let envelope = MessageEnvelope::from_bytes(&wire).unwrap();
        assert_eq!(c.bob.decrypt(&envelope).unwrap(), vec![i; 100]);

        let wire = c.bob.encrypt(&[i; 3]).unwrap().to_bytes().unwrap();
        let envelope = MessageEnvelope::from_bytes(&wire).unwrap();
        assert_eq!(c.alice.decrypt(&envelope).unwrap(), vec![i; 3]);
    }
}

#[test]
fn test_bundle_survives_directory_json() {
    let alice = generate_identity().unwrap();
    let mut bob = LocalPreKeys::new(generate_identity().unwrap(), 7, &small_prekeys()).unwrap();

    let json = serde_json::to_string(&bob.bundle()).unwrap();
    let fetched: PreKeyBundle = serde_json::from_str(&json).unwrap();

    let (secret, initial) = x3dh::initiate(&alice, &fetched).unwrap();
    let initial = x3dh::InitialMessage::from_bytes(&initial.to_bytes()).unwrap();
    let bob_secret = x3dh::respond(&mut bob, &initial).unwrap();

    assert_eq!(secret.key(), bob_secret.key());
}

#[test]
fn test_exhausted_one_time_pool_falls_back() {
    let alice = generate_identity().unwrap();
    let mut bob = LocalPreKeys::new(generate_identity().unwrap(), 1, &small_prekeys()).unwrap();

    for _ in 0..small_prekeys().one_time_batch {
        let (_, initial) = x3dh::initiate(&alice, &bob.bundle()).unwrap();
        x3dh::respond(&mut bob, &initial).unwrap();
    }
    assert_eq!(bob.one_time_count(), 0);

    let bundle = bob.bundle();
    assert!(bundle.one_time_prekey.is_none());
    let (secret, initial) = x3dh::initiate(&alice, &bundle).unwrap();
    assert_eq!(x3dh::respond(&mut bob, &initial).unwrap().key(), secret.key());

    assert_eq!(bob.replenish(4).unwrap(), 4);
    assert!(bob.bundle().one_time_prekey.is_some());
}

// ============================================================================
// Forward secrecy
// ============================================================================

#[test]
fn test_chain_key_cannot_reproduce_earlier_keys() {
    let mut chain = ChainKey::from_bytes([9u8; 32]);
    let earlier: Vec<[u8; 32]> = (0..4).map(|_| *chain.ratchet().as_bytes()).collect();

    let mut compromised = ChainKey::from_bytes(*chain.as_bytes());
    for _ in 0..64 {
        let later = compromised.ratchet();
        assert!(!earlier.contains(later.as_bytes()));
    }
}

#[test]
fn test_compromised_state_cannot_decrypt_past_messages() {
    let mut c = conversation();

    let past = c.alice.encrypt(b"before compromise").unwrap();
    c.bob.decrypt(&past).unwrap();

    let mut stolen = RatchetState::from_bytes(&c.bob.to_bytes().unwrap()).unwrap();
    assert_eq!(stolen.decrypt(&past), Err(CryptoError::ReplayedMessage));
}

// ============================================================================
// Out-of-order delivery and replay
// ============================================================================

#[test]
fn test_out_of_order_three_one_two() {
    let mut c = conversation();

    let m1 = c.alice.encrypt(b"1").unwrap();
    let m2 = c.alice.encrypt(b"2").unwrap();
    let m3 = c.alice.encrypt(b"3").unwrap();

    assert_eq!(c.bob.decrypt(&m3).unwrap(), b"3");
    assert_eq!(c.bob.decrypt(&m1).unwrap(), b"1");
    assert_eq!(c.bob.decrypt(&m2).unwrap(), b"2");
    assert_eq!(c.bob.skipped_len(), 0);
}

#[test]
fn test_out_of_order_across_ratchet_steps() {
    let mut c = conversation();

    let a0 = c.alice.encrypt(b"a0").unwrap();
    let a1 = c.alice.encrypt(b"a1").unwrap();
    c.bob.decrypt(&a0).unwrap();

    let b0 = c.bob.encrypt(b"b0").unwrap();
    let b1 = c.bob.encrypt(b"b1").unwrap();
    assert_eq!(c.alice.decrypt(&b1).unwrap(), b"b1");

    let a2 = c.alice.encrypt(b"a2").unwrap();
    assert_eq!(c.bob.decrypt(&a2).unwrap(), b"a2");
    assert_eq!(c.bob.decrypt(&a1).unwrap(), b"a1");
    assert_eq!(c.alice.decrypt(&b0).unwrap(), b"b0");

    assert_eq!(c.alice.skipped_len(), 0);
    assert_eq!(c.bob.skipped_len(), 0);
}

#[test]
fn test_replay_rejected() {
    let mut c = conversation();

    let envelope = c.alice.encrypt(b"once").unwrap();
    assert!(c.bob.decrypt(&envelope).is_ok());
    assert_eq!(c.bob.decrypt(&envelope), Err(CryptoError::ReplayedMessage));
    assert!(CryptoError::ReplayedMessage.is_security_relevant());
}

// ============================================================================
// Tamper detection
// ============================================================================

#[test]
fn test_tamper_detection() {
    let mut c = conversation();
    let _ = c.alice.encrypt(b"m0").unwrap();
    let envelope = c.alice.encrypt(b"the real message").unwrap();
    let wire = envelope.to_bytes().unwrap();

    let ciphertext_offset = wire.len() - envelope.ciphertext.len();
    let tag_offset = ciphertext_offset - 4 - 16;
    let nonce_offset = HEADER_SIZE;

    let flips = [
        ("ratchet key", 5),
        ("previous chain length", 36),
        ("counter", HEADER_SIZE - 1),
        ("nonce", nonce_offset + 3),
        ("tag", tag_offset + 15),
        ("ciphertext", ciphertext_offset + 2),
    ];

    for (field, offset) in flips {
        let mut forged = wire.clone();
        forged[offset] ^= 0x01;
        let forged = MessageEnvelope::from_bytes(&forged).unwrap();

        assert_eq!(
            c.bob.decrypt(&forged),
            Err(CryptoError::AuthenticationFailed),
            "flipped {field}"
        );
        assert_eq!(c.bob.receiving_index(), 0, "state moved after {field}");
    }

    assert_eq!(c.bob.decrypt(&envelope).unwrap(), b"the real message");
}

#[test]
fn test_version_tamper_rejected_at_decode() {
    let mut c = conversation();
    let mut wire = c.alice.encrypt(b"x").unwrap().to_bytes().unwrap();
    wire[0] = 0x02;

    assert_eq!(
        MessageEnvelope::from_bytes(&wire),
        Err(CryptoError::UnsupportedVersion(0x02))
    );
}

#[test]
fn test_swapped_nonce_rejected() {
    let mut c = conversation();
    let mut envelope = c.alice.encrypt(b"x").unwrap();
    envelope.nonce = Nonce::random().unwrap();

    assert_eq!(c.bob.decrypt(&envelope), Err(CryptoError::AuthenticationFailed));
}

// ============================================================================
// Bundle forgery
// ============================================================================

#[test]
fn test_forged_bundle_rejected() {
    let alice = generate_identity().unwrap();
    let bob = LocalPreKeys::new(generate_identity().unwrap(), 1, &small_prekeys()).unwrap();
    let mallory = generate_identity().unwrap();

    // Directory swaps in an attacker-controlled signed pre-key
    let mut bundle = bob.bundle();
    let substitute = generate_signed_prekey(&mallory, bundle.signed_prekey_id).unwrap();
    bundle.signed_prekey = substitute.public_key();
    assert_eq!(
        x3dh::initiate(&alice, &bundle).err(),
        Some(CryptoError::SignatureInvalid)
    );

    // Or swaps the whole identity but keeps the old signature
    let mut bundle = bob.bundle();
    bundle.identity = mallory.public();
    assert_eq!(
        x3dh::initiate(&alice, &bundle).err(),
        Some(CryptoError::SignatureInvalid)
    );
}

// ============================================================================
// Bounded memory
// ============================================================================

#[test]
fn test_skipping_1001_keys_rejected() {
    let mut c = conversation();
    let envelopes: Vec<_> = (0..1002).map(|_| c.alice.encrypt(b"flood").unwrap()).collect();

    assert_eq!(c.bob.decrypt(&envelopes[1001]), Err(CryptoError::SkippedTooMany));
    assert_eq!(c.bob.skipped_len(), 0);

    assert_eq!(c.bob.decrypt(&envelopes[1000]).unwrap(), b"flood");
    assert_eq!(c.bob.skipped_len(), 1000);

    // A full cache still accepts the next message and the cached ones
    assert_eq!(c.bob.decrypt(&envelopes[1001]).unwrap(), b"flood");
    assert_eq!(c.bob.decrypt(&envelopes[0]).unwrap(), b"flood");
    assert_eq!(c.bob.skipped_len(), 999);
}

#[test]
fn test_skip_flood_across_ratchet_step() {
    let mut c = conversation_with(SessionConfig {
        max_skip: 8,
        ..SessionConfig::default()
    });

    let first = c.alice.encrypt(b"first").unwrap();
    let unsent: Vec<_> = (0..10).map(|_| c.alice.encrypt(b"lost").unwrap()).collect();
    c.bob.decrypt(&first).unwrap();
    c.alice.decrypt(&c.bob.encrypt(b"reply").unwrap()).unwrap();

    // New chain claims 10 previous messages; caching them would exceed the bound
    let next = c.alice.encrypt(b"next").unwrap();
    assert_eq!(next.header.previous_chain_length, 11);
    assert_eq!(c.bob.decrypt(&next), Err(CryptoError::SkippedTooMany));

    // Delivering the stragglers first shrinks the gap
    for envelope in &unsent[..3] {
        c.bob.decrypt(envelope).unwrap();
    }
    assert_eq!(c.bob.decrypt(&next).unwrap(), b"next");
    assert_eq!(c.bob.skipped_len(), 7);
}

// ============================================================================
// Session store
// ============================================================================

#[test]
fn test_store_runs_conversation_both_sides() {
    let c = conversation();
    let alice_id = c.alice_id();
    let bob_id = alice_id.reversed();

    let store = SessionStore::new();
    store.insert(alice_id, c.alice);
    store.insert(bob_id, c.bob);

    for i in 0..10u8 {
        let envelope = store
            .with_exclusive_access(&alice_id, |s| s.encrypt(&[i]))
            .unwrap();
        let plaintext = store
            .with_exclusive_access(&bob_id, |s| s.decrypt(&envelope))
            .unwrap();
        assert_eq!(plaintext, vec![i]);
    }
    assert_eq!(store.len(), 2);
}

#[test]
fn test_store_parallel_sessions() {
    let store = Arc::new(SessionStore::new());

    let threads: Vec<_> = (0..6)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let c = conversation();
                let alice_id = c.alice_id();
                let bob_id = alice_id.reversed();
                store.get_or_create(alice_id, || Ok(c.alice)).unwrap();
                store.get_or_create(bob_id, || Ok(c.bob)).unwrap();

                for i in 0..50u32 {
                    let envelope = store
                        .with_exclusive_access(&alice_id, |s| s.encrypt(&i.to_be_bytes()))
                        .unwrap();
                    let plaintext = store
                        .with_exclusive_access(&bob_id, |s| s.decrypt(&envelope))
                        .unwrap();
                    assert_eq!(plaintext, i.to_be_bytes());
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(store.len(), 12);
}

#[test]
fn test_store_persistence_inside_exclusive_section() {
    let c = conversation();
    let alice_id = c.alice_id();
    let mut bob = c.bob;

    let store = SessionStore::new();
    store.insert(alice_id, c.alice);

    // Host persists together with each send; the blob always matches memory
    let mut persisted = Vec::new();
    for i in 0..3u8 {
        let envelope = store
            .with_exclusive_access(&alice_id, |s| {
                let envelope = s.encrypt(&[i])?;
                persisted = s.to_bytes()?.to_vec();
                Ok::<_, CryptoError>(envelope)
            })
            .unwrap();
        bob.decrypt(&envelope).unwrap();
    }

    // Simulated restart
    let restarted = SessionStore::new();
    restarted.restore(alice_id, &persisted).unwrap();
    let envelope = restarted
        .with_exclusive_access(&alice_id, |s| s.encrypt(b"after restart"))
        .unwrap();
    assert_eq!(envelope.header.counter, 3);
    assert_eq!(bob.decrypt(&envelope).unwrap(), b"after restart");
}

#[test]
fn test_responder_initial_message_id_consumed() {
    let c = conversation();
    assert_eq!(c.initial.one_time_prekey_id, Some(1));
    assert_eq!(c.bob_prekeys.one_time_count(), 3);
    assert_eq!(hex::encode(c.alice_id().local.as_bytes()).len(), 64);
}
