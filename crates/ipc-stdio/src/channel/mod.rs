//! Duplex message channel between the supervisor and a client.
//!
//! Two independent one-directional queues, keyed from a shared naming path:
//!
//! - **to-server**: client input destined for the child's stdin
//! - **to-client**: child output destined for the client's stdout
//!
//! Messages carry at most [`MAX_CHUNK`] bytes. Chunk boundaries carry no
//! meaning, consumers treat each direction as a plain byte stream.
//!
//! # Implementations
//!
//! - **sysv**: System V kernel message queues (persist independently of either peer)
//! - **memory**: in-process bounded queues with identical semantics

pub mod key;
pub mod memory;
pub mod sysv;

use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

pub use key::{ChannelKey, Direction};
pub use memory::MemoryQueue;
pub use sysv::SysvQueue;

/// Largest payload a single message may carry. Not negotiated, both peers
/// must agree on it.
pub const MAX_CHUNK: usize = 8192;

/// Type tag stamped on every message and used as the receive selector.
pub const MESSAGE_TYPE: i64 = 1;

/// Whether a queue operation may suspend the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Block,
    NoWait,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("cannot create IPC key for {path}: {source}")]
    Key {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot open IPC queue: {0}")]
    Open(#[source] io::Error),

    /// Non-blocking receive found nothing queued.
    #[error("no message available")]
    Empty,

    /// Non-blocking send found the queue at capacity.
    #[error("queue is full")]
    Full,

    #[error("payload of {len} bytes exceeds the {max} byte message limit")]
    Oversized { len: usize, max: usize },

    /// The queue was removed underneath us.
    #[error("queue was removed")]
    Closed,

    #[error("queue I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Conditions a caller may retry after a short pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Empty | Self::Full)
    }
}

/// One direction of the channel.
pub trait Queue: Send + Sync {
    /// Enqueue one message. `payload.len()` must not exceed [`MAX_CHUNK`].
    fn send(&self, payload: &[u8], wait: Wait) -> Result<(), ChannelError>;

    /// Dequeue one message of type [`MESSAGE_TYPE`].
    fn recv(&self, wait: Wait) -> Result<Bytes, ChannelError>;

    /// Remove the queue. Calling this more than once is a no-op.
    fn destroy(&self) -> Result<(), ChannelError>;
}

pub(crate) fn check_len(payload: &[u8]) -> Result<(), ChannelError> {
    if payload.len() > MAX_CHUNK {
        return Err(ChannelError::Oversized {
            len: payload.len(),
            max: MAX_CHUNK,
        });
    }
    Ok(())
}

/// A peer's view of the channel: what it reads and what it writes.
#[derive(Clone)]
pub struct Duplex {
    pub inbound: Arc<dyn Queue>,
    pub outbound: Arc<dyn Queue>,
}

impl Duplex {
    /// Create (or reuse) both kernel queues for the supervisor side.
    ///
    /// The returned queues are owned: they are removed on [`Duplex::destroy`]
    /// or when the last handle drops.
    pub fn create_server(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let outbound_key = ChannelKey::derive(path, Direction::ToClient)?;
        let inbound_key = ChannelKey::derive(path, Direction::ToServer)?;

        let inbound = SysvQueue::create(inbound_key)?;
        let outbound = SysvQueue::create(outbound_key)?;

        tracing::debug!(
            path = %path.display(),
            inbound = inbound.id(),
            inbound_key = %inbound.key(),
            outbound = outbound.id(),
            outbound_key = %outbound.key(),
            "Created IPC queues"
        );

        Ok(Self {
            inbound: Arc::new(inbound),
            outbound: Arc::new(outbound),
        })
    }

    /// Attach to queues previously created by a supervisor.
    ///
    /// Fails with [`ChannelError::Open`] when no supervisor has created them.
    pub fn attach_client(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let inbound_key = ChannelKey::derive(path, Direction::ToClient)?;
        let outbound_key = ChannelKey::derive(path, Direction::ToServer)?;

        let inbound = SysvQueue::open(inbound_key)?;
        let outbound = SysvQueue::open(outbound_key)?;

        tracing::debug!(
            path = %path.display(),
            inbound = inbound.id(),
            outbound = outbound.id(),
            "Attached to IPC queues"
        );

        Ok(Self {
            inbound: Arc::new(inbound),
            outbound: Arc::new(outbound),
        })
    }

    /// Connected in-process pair: `(server side, client side)`.
    pub fn memory(capacity: usize) -> (Self, Self) {
        let to_server: Arc<dyn Queue> = Arc::new(MemoryQueue::new(capacity));
        let to_client: Arc<dyn Queue> = Arc::new(MemoryQueue::new(capacity));

        let server = Self {
            inbound: Arc::clone(&to_server),
            outbound: Arc::clone(&to_client),
        };
        let client = Self {
            inbound: to_client,
            outbound: to_server,
        };
        (server, client)
    }

    /// Remove both queues. Both are attempted even if the first fails.
    pub fn destroy(&self) -> Result<(), ChannelError> {
        let outbound = self.outbound.destroy();
        let inbound = self.inbound.destroy();
        outbound.and(inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pair_is_crossed() {
        let (server, client) = Duplex::memory(4);

        client.outbound.send(b"to server", Wait::NoWait).unwrap();
        server.outbound.send(b"to client", Wait::NoWait).unwrap();

        assert_eq!(&server.inbound.recv(Wait::NoWait).unwrap()[..], b"to server");
        assert_eq!(&client.inbound.recv(Wait::NoWait).unwrap()[..], b"to client");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (server, _client) = Duplex::memory(4);
        let payload = vec![0u8; MAX_CHUNK + 1];

        let err = server.outbound.send(&payload, Wait::NoWait).unwrap_err();
        assert!(matches!(err, ChannelError::Oversized { len, max } if len == MAX_CHUNK + 1 && max == MAX_CHUNK));
    }

    #[test]
    fn max_chunk_payload_is_accepted() {
        let (server, client) = Duplex::memory(4);
        let payload = vec![7u8; MAX_CHUNK];

        server.outbound.send(&payload, Wait::NoWait).unwrap();
        assert_eq!(client.inbound.recv(Wait::NoWait).unwrap().len(), MAX_CHUNK);
    }

    #[test]
    fn transient_errors() {
        assert!(ChannelError::Empty.is_transient());
        assert!(ChannelError::Full.is_transient());
        assert!(!ChannelError::Closed.is_transient());
    }

    #[test]
    fn error_messages() {
        insta::assert_snapshot!(
            ChannelError::Oversized { len: 9000, max: MAX_CHUNK },
            @"payload of 9000 bytes exceeds the 8192 byte message limit"
        );
        insta::assert_snapshot!(
            ChannelError::Open(io::Error::from_raw_os_error(libc::ENOENT)),
            @"cannot open IPC queue: No such file or directory (os error 2)"
        );
    }

    #[test]
    fn destroy_is_idempotent() {
        let (server, client) = Duplex::memory(4);
        server.destroy().unwrap();
        server.destroy().unwrap();
        assert!(matches!(client.inbound.recv(Wait::NoWait), Err(ChannelError::Closed)));
    }
}
