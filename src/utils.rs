//! Utility functions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Version information for the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Backoff options for failed cycles
#[derive(Debug, Clone)]
pub struct BackoffOptions {
    /// Upper bound on the doubling factor
    pub max_factor: u32,

    /// Hard ceiling on the computed delay
    pub max_delay: Duration,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            max_factor: 16,
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

/// Delay before the next cycle after `consecutive_failures` failed ones.
///
/// The base interval is multiplied by `min(2^k, max_factor)` and clamped at
/// `max_delay`, never dropping below the base interval itself.
pub fn backoff_delay(options: &BackoffOptions, base: Duration, consecutive_failures: u32) -> Duration {
    let factor = 2u32
        .saturating_pow(consecutive_failures.min(31))
        .min(options.max_factor);
    let delay = base.saturating_mul(factor);
    let ceiling = std::cmp::max(options.max_delay, base);
    std::cmp::min(delay, ceiling)
}

/// Spread a delay by up to `fraction` in either direction so that multiple
/// controllers polling the same sources do not wake in lockstep.
pub fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return delay;
    }
    let unit = (uuid::Uuid::new_v4().as_u128() % 2001) as f64 / 1000.0 - 1.0;
    let scaled = delay.as_secs_f64() * (1.0 + fraction * unit);
    Duration::from_secs_f64(scaled.max(0.0))
}

/// Calculate SHA256 hash of data
pub fn sha256_hash(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Hex encoding utilities
mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(data: impl AsRef<[u8]>) -> String {
        let data = data.as_ref();
        let mut result = String::with_capacity(data.len() * 2);
        for byte in data {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        result
    }
}
