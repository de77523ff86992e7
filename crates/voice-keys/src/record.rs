//! Per-key usage metrics record
//!
//! Timestamps are unix milliseconds (absolute, not deltas), so window
//! rollover detection works across process restarts and between instances
//! sharing one store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Configured rate limits for one key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeyLimits {
    pub max_requests_per_minute: u32,
    pub max_tokens_per_minute: u64,
    pub max_requests_per_day: u32,
}

impl Default for KeyLimits {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 15,
            max_tokens_per_minute: 1_000_000,
            max_requests_per_day: 1_500,
        }
    }
}

/// Usage, limits, and failure state for one upstream API key.
///
/// The pool is the only writer; the store holds whatever was last written
/// (last-writer-wins under concurrent instances).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetrics {
    /// Stable identifier derived from the secret; safe to log
    pub id: String,
    /// Raw API key, used only at call time and never logged
    pub secret: String,

    // Usage counters, reset at window rollover
    pub requests_this_minute: u32,
    pub tokens_this_minute: u64,
    pub requests_today: u32,

    // Configured limits
    pub max_requests_per_minute: u32,
    pub max_tokens_per_minute: u64,
    pub max_requests_per_day: u32,

    // Window anchors, unix millis
    pub minute_window_started_at: u64,
    pub day_window_started_at: u64,

    // Failure state
    pub last_failure_at: Option<u64>,
    pub last_failure_message: Option<String>,
    pub last_failure_dimension: Option<String>,
    pub consecutive_failures: u32,

    /// Cleared after repeated failures; restored only by operator action
    pub is_active: bool,
}

impl KeyMetrics {
    /// Fresh record for a newly configured secret. Counters start at zero
    /// and both windows are anchored at `now`.
    pub fn new(secret: String, limits: KeyLimits, now: u64) -> Self {
        Self {
            id: derive_key_id(&secret),
            secret,
            requests_this_minute: 0,
            tokens_this_minute: 0,
            requests_today: 0,
            max_requests_per_minute: limits.max_requests_per_minute,
            max_tokens_per_minute: limits.max_tokens_per_minute,
            max_requests_per_day: limits.max_requests_per_day,
            minute_window_started_at: now,
            day_window_started_at: now,
            last_failure_at: None,
            last_failure_message: None,
            last_failure_dimension: None,
            consecutive_failures: 0,
            is_active: true,
        }
    }
}

/// Derive a stable key id from a raw secret.
///
/// First 8 hex characters of SHA-256, matching what operators see in logs
/// and the health endpoint. The secret itself never appears anywhere.
pub fn derive_key_id(secret: &str) -> String {
    let hash = Sha256::digest(secret.as_bytes());
    let mut hex = String::with_capacity(8);
    for byte in &hash[..4] {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
