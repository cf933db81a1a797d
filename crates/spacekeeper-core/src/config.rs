//! Tunable knobs recognized by the engine, per spec §6.
//!
//! Mirrors the struct-of-settings-with-`Default`-impl convention the
//! teacher uses for `BrowserSettings` (`crates/browser/src/settings.rs`),
//! loadable from a TOML file on disk.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpacesConfig {
    pub lock_timeout_ms: u64,
    pub cache_ttl_ms: u64,
    pub incremental_update_threshold: u32,
    pub broadcast_debounce_ms: u64,
    pub storage_debounce_ms: u64,
    pub batch_window_ms: u64,
    pub max_queue_size: usize,
    pub restore_gate_ms: u64,
    pub url_match_threshold_named: f64,
    pub url_match_threshold_unnamed: f64,
    pub space_name_max_length: usize,
    pub startup_delay_ms: u64,
    pub recovery_check_delay_ms: u64,
}

impl Default for SpacesConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            cache_ttl_ms: 300_000,
            incremental_update_threshold: 10,
            broadcast_debounce_ms: 100,
            storage_debounce_ms: 200,
            batch_window_ms: 50,
            max_queue_size: 100,
            restore_gate_ms: 30_000,
            url_match_threshold_named: 0.30,
            url_match_threshold_unnamed: 0.50,
            space_name_max_length: 128,
            startup_delay_ms: 0,
            recovery_check_delay_ms: 0,
        }
    }
}

impl SpacesConfig {
    /// Parse a config from a TOML file. Missing fields fall back to their
    /// defaults because every field is `#[serde(default)]`.
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}
