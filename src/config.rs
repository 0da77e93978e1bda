//! Configuration management for dvault

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default file size threshold for routing a commit to the delta path (50MB)
pub const DEFAULT_DELTA_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Default file size above which binary diffing is never attempted (100MB)
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Default maximum number of delta links between a version and its base snapshot
pub const DEFAULT_MAX_CHAIN_LENGTH: u32 = 5;

/// Default delta acceptance bound: a patch larger than this fraction of the
/// original data is discarded in favor of a full snapshot
pub const DEFAULT_DELTA_ACCEPT_RATIO: f64 = 0.95;

/// A snapshot may not grow beyond this multiple of its input
pub const SNAPSHOT_EXPANSION_LIMIT: f64 = 1.2;

/// Default delay before background optimization starts (seconds)
pub const DEFAULT_OPTIMIZE_DELAY_SECS: u64 = 3;

/// Extensions of layered-document formats eligible for smart deltas
pub const LAYERED_EXTENSIONS: &[&str] = &["psd", "ai", "sketch"];

/// Main configuration struct
///
/// Loaded from the repository's `config` document; every field has a
/// default so a missing or partial document is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Author recorded in commit records
    pub author: String,

    /// File size threshold for the delta path (bytes)
    pub delta_threshold: u64,

    /// File size above which a fresh snapshot is always taken (bytes)
    pub snapshot_threshold: u64,

    /// Maximum delta chain length before a snapshot is forced
    pub max_chain_length: u32,

    /// Patch-size / original-size bound above which a delta is discarded
    pub delta_accept_ratio: f64,

    /// Re-encode snapshots under the higher-ratio codec in the background
    pub background_optimize: bool,

    /// Delay before a background optimization task starts (seconds)
    pub optimize_delay_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            author: "dvault user".to_string(),
            delta_threshold: DEFAULT_DELTA_THRESHOLD,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
            delta_accept_ratio: DEFAULT_DELTA_ACCEPT_RATIO,
            background_optimize: false,
            optimize_delay_secs: DEFAULT_OPTIMIZE_DELAY_SECS,
        }
    }
}

impl Config {
    /// Load configuration from the repository's `config` document.
    ///
    /// A missing document yields defaults; a malformed one is reported.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| crate::error::Error::io("reading config document", e))?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }

    /// Check whether a file of this size routes the commit to the delta path
    pub fn wants_delta(&self, size: u64) -> bool {
        size > self.delta_threshold
    }

    /// Check whether a file of this size forces a fresh snapshot
    /// (binary diffing cost exceeds its benefit)
    pub fn forces_snapshot(&self, size: u64) -> bool {
        size > self.snapshot_threshold
    }

    /// Check whether an extension names a layered-document format
    pub fn is_layered_extension(ext: &str) -> bool {
        let ext = ext.trim_start_matches('.');
        LAYERED_EXTENSIONS
            .iter()
            .any(|candidate| ext.eq_ignore_ascii_case(candidate))
    }
}
