//! Generator configuration with TOML preset support.
//!
//! All tweakable settings (render-target pool size classes, global picmip
//! level, worker-thread timing) are consolidated here. Options serialize
//! to/from TOML; partial files fill missing fields with defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::WeftError;

/// Runtime configuration for the composite texture generator. All fields
/// use `#[serde(default)]` so partial TOML files (e.g. only overriding
/// `picmip`) work correctly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorOptions {
    /// Render-target pool size classes in pixels, one shared target per
    /// entry. Must be powers of two; listed largest to smallest.
    pub pool_sizes: Vec<u32>,
    /// Global picmip level: requested texture sizes are divided by
    /// `2^picmip` unless the request opts out.
    pub picmip: u32,
    /// Sleep between worker-thread generation steps, in milliseconds.
    pub worker_poll_ms: u64,
    /// How long the worker blocks waiting for new queue entries before
    /// rechecking the exit flag, in milliseconds.
    pub queue_wait_ms: u64,
    /// Bounded timeout for one readback wait-handle poll, in milliseconds.
    pub readback_wait_ms: u64,
    /// Free the CPU-side compressed copy once it has been uploaded to the
    /// published texture. Leave off when the texture system may ask for
    /// the bits again (lazy regeneration).
    pub release_result_after_upload: bool,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            pool_sizes: vec![2048, 1024, 512, 256, 128],
            picmip: 0,
            worker_poll_ms: 4,
            queue_wait_ms: 50,
            readback_wait_ms: 20,
            release_result_after_upload: false,
        }
    }
}

impl GeneratorOptions {
    /// Load options from a TOML file. Missing fields use defaults.
    ///
    /// # Errors
    ///
    /// Returns [`WeftError::Io`] if the file cannot be read, or
    /// [`WeftError::OptionsParse`] if it is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, WeftError> {
        let content = std::fs::read_to_string(path).map_err(WeftError::Io)?;
        toml::from_str(&content)
            .map_err(|e| WeftError::OptionsParse(e.to_string()))
    }

    /// Save options to a TOML file (pretty-printed).
    ///
    /// # Errors
    ///
    /// Returns [`WeftError::OptionsParse`] if serialization fails, or
    /// [`WeftError::Io`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), WeftError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| WeftError::OptionsParse(e.to_string()))?;
        std::fs::write(path, content).map_err(WeftError::Io)
    }
}
