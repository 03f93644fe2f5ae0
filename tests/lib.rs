//! Shared fixtures for the Kocmoc integration tests.

use kocmoc_crypto::config::{PreKeyConfig, SessionConfig};
use kocmoc_crypto::keys::{IdentityKeyPair, LocalPreKeys, generate_identity};
use kocmoc_crypto::ratchet::RatchetState;
use kocmoc_crypto::session::SessionId;
use kocmoc_crypto::x3dh::{self, InitialMessage};

/// Two seeded sessions plus the key material that produced them.
pub struct Conversation {
    /// Initiator identity
    pub alice_identity: IdentityKeyPair,
    /// Responder pre-key pool, after the handshake
    pub bob_prekeys: LocalPreKeys,
    /// Initial message the initiator sent
    pub initial: InitialMessage,
    /// Initiator session
    pub alice: RatchetState,
    /// Responder session
    pub bob: RatchetState,
}

impl Conversation {
    /// Session id as seen by the initiator
    pub fn alice_id(&self) -> SessionId {
        SessionId::new(
            self.alice_identity.public().agreement,
            self.bob_prekeys.identity().public().agreement,
        )
    }
}

/// Pre-key settings with a small one-time batch so fixtures stay fast.
pub fn small_prekeys() -> PreKeyConfig {
    PreKeyConfig {
        one_time_batch: 4,
        ..PreKeyConfig::default()
    }
}

/// Run X3DH and seed both sides with default limits.
pub fn conversation() -> Conversation {
    conversation_with(SessionConfig::default())
}

/// Run X3DH and seed both sides with `config`.
///
/// # Panics
///
/// Panics if any step of the handshake fails.
pub fn conversation_with(config: SessionConfig) -> Conversation {
    init_tracing();

    let alice_identity = generate_identity().expect("identity");
    let mut bob_prekeys =
        LocalPreKeys::new(generate_identity().expect("identity"), 1, &small_prekeys())
            .expect("pre-keys");

    let (alice_secret, initial) =
        x3dh::initiate(&alice_identity, &bob_prekeys.bundle()).expect("initiate");
    let bob_secret = x3dh::respond(&mut bob_prekeys, &initial).expect("respond");

    Conversation {
        alice_identity,
        bob_prekeys,
        initial,
        alice: RatchetState::seed(alice_secret, config).expect("seed initiator"),
        bob: RatchetState::seed(bob_secret, config).expect("seed responder"),
    }
}

/// Route library logs to the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
