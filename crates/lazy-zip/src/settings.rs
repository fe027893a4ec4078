//! Unified configuration for the `lazy-zip` crate.
//!
//! A single flat structure covering every tunable:
//! - pool shape (lane multiplier),
//! - fetch strategy overrides (forced in-memory mode),
//! - fragment cache behavior (retention, store location),
//! - HTTP downloader behavior (per-phase timeout).

use std::path::PathBuf;
use std::time::Duration;

/// Unified settings for a [`LazyZip`](crate::LazyZip) pool.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Number of parallel fetch lanes the pool runs when the server honors
    /// range requests. Values below 1 are treated as 1.
    /// Default: 4.
    pub lane_multiply: usize,

    /// Skip range probing entirely and download the whole archive into
    /// memory up front, as if the server had rejected ranges.
    /// Default: false.
    pub force_in_memory: bool,

    /// Skip the eviction sweep when the fragment store is opened, retaining
    /// every cached fragment regardless of age or count.
    /// Coworker lanes always behave as if this were set.
    /// Default: false.
    pub force_keep_cache: bool,

    /// Location of the shared sqlite fragment store.
    /// Default: `lazy-zip/fragments.db` under the XDG cache home.
    pub cache_path: Option<PathBuf>,

    /// Timeout for a single HTTP phase (sending a request, collecting a
    /// body). Default: 30 seconds.
    pub request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lane_multiply: 4,
            force_in_memory: false,
            force_keep_cache: false,
            cache_path: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lane_multiply(mut self, v: usize) -> Self {
        self.lane_multiply = v;
        self
    }

    pub fn force_in_memory(mut self, v: bool) -> Self {
        self.force_in_memory = v;
        self
    }

    pub fn force_keep_cache(mut self, v: bool) -> Self {
        self.force_keep_cache = v;
        self
    }

    pub fn cache_path(mut self, v: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(v.into());
        self
    }

    pub fn request_timeout(mut self, v: Duration) -> Self {
        self.request_timeout = v;
        self
    }
}
