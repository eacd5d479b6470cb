//! Tunables for the refresher's throttles and the pending-op queue's
//! buffer sizing, loaded from `config.toml` with a graceful fallback to
//! defaults — same shape as the teacher's `client/src/config.rs`, with
//! its TTL/LRU knobs replaced by this system's cooldowns and timeouts.

use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Suppresses Refresh-priority candidates while the client queue has
    /// been non-empty within this many milliseconds.
    pub refresh_cooldown_ms: u64,
    /// Same, for Invalid-priority candidates.
    pub invalid_cooldown_ms: u64,
    /// Minimum gap between background (Refresh/Invalid) refresher RPCs
    /// while the host reports itself idle.
    pub back_cooldown_ms: u64,
    /// Same, for Required-priority refresher RPCs.
    pub fore_cooldown_ms: u64,

    pub drive_info_timeout_active_ms: u64,
    pub drive_info_timeout_inactive_ms: u64,
    pub directory_listing_timeout_ms: u64,
    pub power_timeout_ms: u64,

    /// Power-of-two, minimum 256: the rounding unit for `SetAllocated`
    /// when a write would exceed the cached allocated size.
    pub write_buffer_multiple: u64,
    /// Starting read size for an Enumerate RPC; doubled on
    /// `BufferTooSmall` up to `enumerate_buffer_cap`.
    pub enumerate_buffer_initial: u32,
    pub enumerate_buffer_cap: u32,

    /// Target wall-clock budget per TAR engine step.
    pub tar_step_budget_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_cooldown_ms: 1_000,
            invalid_cooldown_ms: 100,
            back_cooldown_ms: 500,
            fore_cooldown_ms: 150,
            drive_info_timeout_active_ms: 20_000,
            drive_info_timeout_inactive_ms: 60_000,
            directory_listing_timeout_ms: 10_000,
            power_timeout_ms: 30_000,
            write_buffer_multiple: 256,
            enumerate_buffer_initial: 4_096,
            enumerate_buffer_cap: 65_536,
            tar_step_budget_ms: 30,
        }
    }
}

pub fn load_config() -> Config {
    let path = Path::new("config.toml");
    if !path.exists() {
        tracing::info!("config.toml not found, using defaults");
        return Config::default();
    }

    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read config.toml, using defaults");
            return Config::default();
        }
    };

    match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse config.toml, using defaults");
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.power_timeout_ms, 30_000);
        assert_eq!(c.write_buffer_multiple, 256);
    }
}
