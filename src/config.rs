//! Runtime configuration for xdna-ctrl.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`XDNA_CTRL_LOCK_TIMEOUT`, etc.)
//! 2. Project-local config file (`./xdna-ctrl.toml`)
//! 3. User config file (`~/.config/xdna-ctrl/config.toml`)
//! 4. Built-in defaults
//!
//! The loaded value is wrapped in an `Arc` by the caller and passed to the
//! [`ArrayManager`](crate::ArrayManager); nothing reads configuration from
//! global state.
//!
//! # Config File Format
//!
//! ```toml
//! # xdna-ctrl.toml
//!
//! # Lock acquire timeout handed to the tile control interface
//! lock_timeout = 2147483647
//!
//! # Start cores through one broadcast event instead of one by one
//! broadcast_enable_core = false
//!
//! # Give up waiting for core done bits after this many polls
//! [core_poll]
//! max_polls = 100000000
//! interval_us = 0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::device::limits;
use crate::poll::PollPolicy;

/// xdna-ctrl runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Lock acquire/release timeout for RTP handoffs.
    pub lock_timeout: Option<u32>,

    /// Polling for core done bits.
    pub core_poll: Option<PollPolicy>,

    /// Polling for DMA queue drain and channel idle.
    pub dma_poll: Option<PollPolicy>,

    /// Polling of the array timer for cycle-based waits.
    pub timer_poll: Option<PollPolicy>,

    /// Timer ticks between firing the enable broadcast and disarming cores.
    pub enable_delay_cycles: Option<u64>,

    /// Start cores with one broadcast event instead of per-core enables.
    pub broadcast_enable_core: Option<bool>,
}

impl RuntimeConfig {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `xdna-ctrl.toml`
    /// 3. User config `~/.config/xdna-ctrl/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();
        log::debug!("Loaded runtime configuration: {:?}", config);

        config
    }

    pub fn lock_timeout(&self) -> u32 {
        self.lock_timeout.unwrap_or(limits::LOCK_TIMEOUT)
    }

    pub fn core_poll(&self) -> PollPolicy {
        self.core_poll.unwrap_or(PollPolicy::UNBOUNDED)
    }

    pub fn dma_poll(&self) -> PollPolicy {
        self.dma_poll.unwrap_or(PollPolicy::UNBOUNDED)
    }

    pub fn timer_poll(&self) -> PollPolicy {
        self.timer_poll.unwrap_or(PollPolicy::UNBOUNDED)
    }

    /// Never below the hardware minimum.
    pub fn enable_delay_cycles(&self) -> u64 {
        self.enable_delay_cycles
            .unwrap_or(limits::ENABLE_BROADCAST_DELAY)
            .max(limits::ENABLE_BROADCAST_DELAY)
    }

    pub fn broadcast_enable_core(&self) -> bool {
        self.broadcast_enable_core.unwrap_or(false)
    }

    /// Bound every poll policy to `n` polls.
    pub fn with_poll_limit(mut self, n: u64) -> Self {
        let bound = |p: Option<PollPolicy>| {
            Some(PollPolicy { max_polls: Some(n), ..p.unwrap_or_default() })
        };
        self.core_poll = bound(self.core_poll);
        self.dma_poll = bound(self.dma_poll);
        self.timer_poll = bound(self.timer_poll);
        self
    }

    /// Load user configuration from ~/.config/xdna-ctrl/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./xdna-ctrl.toml
    fn load_local_config() -> Option<Self> {
        Self::load_from_file(Path::new("xdna-ctrl.toml"))
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.lock_timeout.is_some() {
            self.lock_timeout = other.lock_timeout;
        }
        if other.core_poll.is_some() {
            self.core_poll = other.core_poll;
        }
        if other.dma_poll.is_some() {
            self.dma_poll = other.dma_poll;
        }
        if other.timer_poll.is_some() {
            self.timer_poll = other.timer_poll;
        }
        if other.enable_delay_cycles.is_some() {
            self.enable_delay_cycles = other.enable_delay_cycles;
        }
        if other.broadcast_enable_core.is_some() {
            self.broadcast_enable_core = other.broadcast_enable_core;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("XDNA_CTRL_LOCK_TIMEOUT") {
            match parse_u64(&value).and_then(|v| u32::try_from(v).ok()) {
                Some(timeout) => {
                    log::info!("Using XDNA_CTRL_LOCK_TIMEOUT from environment: {}", timeout);
                    self.lock_timeout = Some(timeout);
                }
                None => log::warn!("Ignoring malformed XDNA_CTRL_LOCK_TIMEOUT={}", value),
            }
        }
        if let Ok(value) = std::env::var("XDNA_CTRL_POLL_LIMIT") {
            match parse_u64(&value) {
                Some(limit) => {
                    log::info!("Using XDNA_CTRL_POLL_LIMIT from environment: {}", limit);
                    *self = std::mem::take(self).with_poll_limit(limit);
                }
                None => log::warn!("Ignoring malformed XDNA_CTRL_POLL_LIMIT={}", value),
            }
        }
        if let Ok(value) = std::env::var("XDNA_CTRL_BROADCAST_ENABLE") {
            let enabled = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
            log::info!("Using XDNA_CTRL_BROADCAST_ENABLE from environment: {}", enabled);
            self.broadcast_enable_core = Some(enabled);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("xdna-ctrl").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# xdna-ctrl configuration
# Place this file at ~/.config/xdna-ctrl/config.toml or ./xdna-ctrl.toml

# Lock acquire timeout for runtime parameter handoffs
# lock_timeout = 2147483647

# Start all cores of a graph with a single broadcast event
# broadcast_enable_core = false

# Timer ticks to hold the broadcast enable armed (minimum 150)
# enable_delay_cycles = 150

# Bound the wait for core done bits (omit max_polls to wait forever)
[core_poll]
# max_polls = 100000000
interval_us = 0

[dma_poll]
interval_us = 0
"#
        .to_string()
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
