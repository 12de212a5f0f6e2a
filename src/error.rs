//! Crate-level error types.

use std::fmt;

/// Errors produced by the weft crate.
#[derive(Debug)]
pub enum WeftError {
    /// A GPU-side resource (render target, result texture) could not be
    /// created.
    Device(String),
    /// Material instantiation returned the error material.
    MaterialCreation(String),
    /// Failed to spawn the generation worker thread.
    ThreadSpawn(std::io::Error),
    /// Generic I/O failure.
    Io(std::io::Error),
    /// TOML options parsing/serialization failure.
    OptionsParse(String),
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(msg) => write!(f, "device resource error: {msg}"),
            Self::MaterialCreation(msg) => {
                write!(f, "material creation failed: {msg}")
            }
            Self::ThreadSpawn(e) => {
                write!(f, "failed to spawn thread: {e}")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::OptionsParse(msg) => {
                write!(f, "options parse error: {msg}")
            }
        }
    }
}

impl std::error::Error for WeftError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ThreadSpawn(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WeftError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
