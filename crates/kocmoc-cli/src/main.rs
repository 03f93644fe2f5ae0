//! Kocmoc E2EE CLI
//!
//! Operator tool for the Kocmoc encryption core: publishes test bundles,
//! decodes wire structures and runs an in-process conversation.

mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use config::Config;
use kocmoc_crypto::CryptoError;
use kocmoc_crypto::envelope::MessageEnvelope;
use kocmoc_crypto::keys::{LocalPreKeys, generate_identity};
use kocmoc_crypto::ratchet::RatchetState;
use kocmoc_crypto::session::{SessionId, SessionStore};
use kocmoc_crypto::x3dh::{self, InitialMessage};

/// Kocmoc - end-to-end encryption core tooling
#[derive(Parser)]
#[command(name = "kocmoc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an identity with pre-keys and print its public bundle as JSON
    Bundle {
        /// Number of one-time pre-keys to generate
        #[arg(long)]
        one_time: Option<u32>,

        /// Device id to publish
        #[arg(long, default_value_t = 1)]
        device_id: u32,
    },

    /// Decode a hex-encoded wire structure and print its cleartext fields
    Inspect {
        /// Hex-encoded bytes
        #[arg(required = true)]
        hex: String,

        /// Decode as an X3DH initial message instead of a message envelope
        #[arg(long)]
        initial: bool,
    },

    /// Run a handshake and a bidirectional, out-of-order conversation in-process
    Selftest {
        /// Messages per direction
        #[arg(short, long, default_value_t = 16)]
        messages: u32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let loaded = if cli.config.is_some() {
        Some(Config::load(&config_path)?)
    } else {
        Config::load_if_exists(&config_path)?
    };
    let defaulted = loaded.is_none();
    let config = loaded.unwrap_or_default();
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    if defaulted {
        tracing::debug!("No config at {}, using defaults", config_path.display());
    }

    match cli.command {
        Commands::Bundle {
            one_time,
            device_id,
        } => print_bundle(one_time, device_id, &config),
        Commands::Inspect { hex, initial } => inspect(&hex, initial),
        Commands::Selftest { messages } => run_selftest(messages, &config),
    }
}

/// Generate key material and print the public bundle
fn print_bundle(one_time: Option<u32>, device_id: u32, config: &Config) -> anyhow::Result<()> {
    let mut prekeys = config.crypto.prekeys;
    if let Some(count) = one_time {
        prekeys.one_time_batch = count;
    }

    let pool = LocalPreKeys::new(generate_identity()?, device_id, &prekeys)?;
    let bundle = pool.bundle();
    bundle.verify()?;

    tracing::info!(
        "Generated identity {} with {} one-time pre-keys",
        bundle.identity.agreement.short_hex(),
        pool.one_time_count()
    );

    println!("{}", serde_json::to_string_pretty(&bundle)?);
    Ok(())
}

/// Decode and print a wire structure
fn inspect(input: &str, initial: bool) -> anyhow::Result<()> {
    let bytes = hex::decode(input.trim())?;

    if initial {
        let message = InitialMessage::from_bytes(&bytes)?;
        println!("X3DH initial message");
        println!("  Identity (signing):   {}", hex::encode(message.identity.signing.to_bytes()));
        println!("  Identity (agreement): {}", hex::encode(message.identity.agreement.as_bytes()));
        println!("  Ephemeral key:        {}", hex::encode(message.ephemeral_key.as_bytes()));
        println!("  Signed pre-key id:    {}", message.signed_prekey_id);
        match message.one_time_prekey_id {
            Some(id) => println!("  One-time pre-key id:  {}", id),
            None => println!("  One-time pre-key id:  none"),
        }
        return Ok(());
    }

    let envelope = MessageEnvelope::from_bytes(&bytes)?;
    println!("Message envelope ({} bytes)", envelope.encoded_len());
    println!("  Ratchet key:          {}", hex::encode(envelope.header.ratchet_key.as_bytes()));
    println!("  Previous chain len:   {}", envelope.header.previous_chain_length);
    println!("  Counter:              {}", envelope.header.counter);
    println!("  Nonce:                {}", hex::encode(envelope.nonce.as_bytes()));
    println!("  Ciphertext:           {} bytes", envelope.ciphertext.len());
    println!("  Tag:                  {}", hex::encode(envelope.tag.as_bytes()));
    Ok(())
}

/// Run a full conversation through a session store
fn run_selftest(messages: u32, config: &Config) -> anyhow::Result<()> {
    if messages == 0 || messages > config.crypto.session.max_skip {
        anyhow::bail!(
            "messages must be between 1 and max_skip ({})",
            config.crypto.session.max_skip
        );
    }

    let alice = generate_identity()?;
    let mut bob = LocalPreKeys::new(generate_identity()?, 1, &config.crypto.prekeys)?;

    // Handshake, with the initial message going through its wire encoding
    let (alice_secret, initial) = x3dh::initiate(&alice, &bob.bundle())?;
    let initial = InitialMessage::from_bytes(&initial.to_bytes())?;
    let bob_secret = x3dh::respond(&mut bob, &initial)?;
    println!("Handshake: ok (one-time pre-key {:?})", initial.one_time_prekey_id);

    let store = SessionStore::new();
    let alice_id = SessionId::new(alice.public().agreement, bob.identity().public().agreement);
    let bob_id = alice_id.reversed();
    store.get_or_create(alice_id, || RatchetState::seed(alice_secret, config.crypto.session))?;
    store.get_or_create(bob_id, || RatchetState::seed(bob_secret, config.crypto.session))?;

    // Alice -> Bob, delivered in reverse order
    let outgoing = (0..messages)
        .map(|i| {
            let text = format!("alice {i}");
            store
                .with_exclusive_access(&alice_id, |s| s.encrypt(text.as_bytes()))
                .and_then(|envelope| envelope.to_bytes())
                .map(|wire| (text, wire))
        })
        .collect::<Result<Vec<_>, CryptoError>>()?;

    for (text, wire) in outgoing.iter().rev() {
        let envelope = MessageEnvelope::from_bytes(wire)?;
        let plaintext = store.with_exclusive_access(&bob_id, |s| s.decrypt(&envelope))?;
        if plaintext != text.as_bytes() {
            anyhow::bail!("plaintext mismatch for {}", text);
        }
    }
    println!("Alice -> Bob: {} messages, reverse order: ok", messages);

    // Replay and tamper must both be rejected without moving the session
    let first = MessageEnvelope::from_bytes(&outgoing[0].1)?;
    let replay = store.with_exclusive_access(&bob_id, |s| s.decrypt(&first));
    if replay != Err(CryptoError::ReplayedMessage) {
        anyhow::bail!("replay not rejected: {:?}", replay.map(|_| ()));
    }

    let mut tampered = store.with_exclusive_access(&alice_id, |s| s.encrypt(b"tamper"))?;
    tampered.ciphertext[0] ^= 0x01;
    let forged = store.with_exclusive_access(&bob_id, |s| s.decrypt(&tampered));
    if forged != Err(CryptoError::AuthenticationFailed) {
        anyhow::bail!("tampering not detected: {:?}", forged.map(|_| ()));
    }
    println!("Replay and tamper rejection: ok");

    // Persist Bob mid-conversation and continue from the restored copy
    let blob = store.snapshot(&bob_id)?;
    store.remove(&bob_id);
    store.restore(bob_id, &blob)?;
    println!("Session persistence: ok ({} bytes)", blob.len());

    // Bob -> Alice, in order
    for i in 0..messages {
        let text = format!("bob {i}");
        let envelope = store.with_exclusive_access(&bob_id, |s| s.encrypt(text.as_bytes()))?;
        let plaintext = store.with_exclusive_access(&alice_id, |s| s.decrypt(&envelope))?;
        if plaintext != text.as_bytes() {
            anyhow::bail!("plaintext mismatch for {}", text);
        }
    }
    println!("Bob -> Alice: {} messages, in order: ok", messages);

    let (sent, skipped) = store.with_exclusive_access(&alice_id, |s| {
        Ok::<_, CryptoError>((s.sending_index(), s.skipped_len()))
    })?;
    tracing::debug!("Alice sending index {}, skipped cache {}", sent, skipped);

    println!("Selftest passed");
    Ok(())
}
