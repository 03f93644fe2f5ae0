//! Tunable limits for sessions and pre-key pools.

use serde::{Deserialize, Serialize};

/// Default bound on cached skipped message keys per session.
pub const DEFAULT_MAX_SKIP: u32 = 1000;

/// Default number of retired remote ratchet keys remembered for replay checks.
pub const DEFAULT_MAX_RETIRED_RATCHET_KEYS: usize = 32;

/// Default size of a freshly generated one-time pre-key batch.
pub const DEFAULT_ONE_TIME_BATCH: u32 = 100;

/// Default signed pre-key lifetime (7 days).
pub const DEFAULT_SIGNED_PREKEY_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level crypto configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Ratchet session limits
    #[serde(default)]
    pub session: SessionConfig,
    /// Pre-key pool settings
    #[serde(default)]
    pub prekeys: PreKeyConfig,
}

/// Ratchet session limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum skipped message keys per gap; the cache keeps at most this
    /// many, evicting the oldest
    #[serde(default = "default_max_skip")]
    pub max_skip: u32,
    /// Retired remote ratchet keys kept to classify late replays
    #[serde(default = "default_max_retired")]
    pub max_retired_ratchet_keys: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skip: DEFAULT_MAX_SKIP,
            max_retired_ratchet_keys: DEFAULT_MAX_RETIRED_RATCHET_KEYS,
        }
    }
}

/// Pre-key pool settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyConfig {
    /// One-time pre-keys generated per replenish
    #[serde(default = "default_one_time_batch")]
    pub one_time_batch: u32,
    /// Age after which the signed pre-key should be rotated
    #[serde(default = "default_signed_prekey_max_age")]
    pub signed_prekey_max_age_secs: u64,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            one_time_batch: DEFAULT_ONE_TIME_BATCH,
            signed_prekey_max_age_secs: DEFAULT_SIGNED_PREKEY_MAX_AGE_SECS,
        }
    }
}

fn default_max_skip() -> u32 {
    DEFAULT_MAX_SKIP
}

fn default_max_retired() -> usize {
    DEFAULT_MAX_RETIRED_RATCHET_KEYS
}

fn default_one_time_batch() -> u32 {
    DEFAULT_ONE_TIME_BATCH
}

fn default_signed_prekey_max_age() -> u64 {
    DEFAULT_SIGNED_PREKEY_MAX_AGE_SECS
}
