//! Version information for ipc-stdio.

use std::fmt;

use crate::channel::MAX_CHUNK;

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build facts reported by `--version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: &'static str,
    /// Per-message payload limit both peers must agree on.
    pub max_chunk: usize,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: VERSION,
            max_chunk: MAX_CHUNK,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Multi-line text for clap's `long_version`.
    pub fn long_version(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.version)?;
        write!(f, "max message payload: {} bytes", self.max_chunk)
    }
}
