//! Channel identity derivation.
//!
//! Both peers derive the same pair of kernel keys from the same naming path.
//! The path must exist; its content is irrelevant, only its inode and device
//! numbers feed the key.
//!
//! Peers given different paths derive unrelated keys and never meet. Nothing
//! detects that misconfiguration.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::ChannelError;

/// Which way messages travel on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client input bound for the child's stdin.
    ToServer,
    /// Child output bound for the client.
    ToClient,
}

impl Direction {
    /// Per-direction project id handed to `ftok(3)`.
    pub const fn discriminator(self) -> u8 {
        match self {
            Self::ToServer => b'b',
            Self::ToClient => b'a',
        }
    }
}

/// A derived System V IPC key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    key: libc::key_t,
    direction: Direction,
}

impl ChannelKey {
    pub fn derive(path: impl AsRef<Path>, direction: Direction) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let key_error = |source: io::Error| ChannelError::Key {
            path: path.display().to_string(),
            source,
        };

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            key_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path contains a NUL byte",
            ))
        })?;

        // Safety: c_path is a valid NUL-terminated string for the duration of the call.
        let key = unsafe { libc::ftok(c_path.as_ptr(), libc::c_int::from(direction.discriminator())) };
        if key == -1 {
            return Err(key_error(io::Error::last_os_error()));
        }

        tracing::trace!(path = %path.display(), ?direction, key, "Derived IPC key");
        Ok(Self { key, direction })
    }

    pub fn raw(&self) -> libc::key_t {
        self.key
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.key)
    }
}
