//! System V message queue transport.
//!
//! Queues live in the kernel and outlive both peers, which is what lets a
//! client attach and detach while the supervised child keeps running.
//!
//! The creating side owns the queue and removes it on destroy or drop. The
//! attaching side never removes anything.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use super::{ChannelError, ChannelKey, MAX_CHUNK, MESSAGE_TYPE, Queue, Wait, check_len};

/// Kernel message layout: `long mtype` followed by the text.
#[repr(C)]
struct MsgBuf {
    mtype: libc::c_long,
    mtext: [u8; MAX_CHUNK],
}

impl MsgBuf {
    fn new() -> Box<Self> {
        Box::new(Self {
            mtype: MESSAGE_TYPE as libc::c_long,
            mtext: [0; MAX_CHUNK],
        })
    }
}

pub struct SysvQueue {
    id: libc::c_int,
    key: ChannelKey,
    owner: bool,
    removed: AtomicBool,
}

impl SysvQueue {
    /// Create the queue (or reuse an existing one), read/write for the owner only.
    pub fn create(key: ChannelKey) -> Result<Self, ChannelError> {
        let flags = libc::IPC_CREAT | (libc::S_IRUSR | libc::S_IWUSR) as libc::c_int;
        let id = Self::get(key, flags)?;
        tracing::trace!(%key, direction = ?key.direction(), id, "Created queue");
        Ok(Self {
            id,
            key,
            owner: true,
            removed: AtomicBool::new(false),
        })
    }

    /// Attach to a queue some other process created.
    pub fn open(key: ChannelKey) -> Result<Self, ChannelError> {
        let id = Self::get(key, 0)?;
        tracing::trace!(%key, direction = ?key.direction(), id, "Opened queue");
        Ok(Self {
            id,
            key,
            owner: false,
            removed: AtomicBool::new(false),
        })
    }

    fn get(key: ChannelKey, flags: libc::c_int) -> Result<libc::c_int, ChannelError> {
        // Safety: msgget takes plain integers.
        let id = unsafe { libc::msgget(key.raw(), flags) };
        if id == -1 {
            return Err(ChannelError::Open(io::Error::last_os_error()));
        }
        Ok(id)
    }

    pub fn id(&self) -> libc::c_int {
        self.id
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

fn map_errno(err: io::Error) -> ChannelError {
    match err.raw_os_error() {
        Some(libc::EIDRM) | Some(libc::EINVAL) => ChannelError::Closed,
        _ => ChannelError::Io(err),
    }
}

impl Queue for SysvQueue {
    fn send(&self, payload: &[u8], wait: Wait) -> Result<(), ChannelError> {
        check_len(payload)?;

        let mut buf = MsgBuf::new();
        buf.mtext[..payload.len()].copy_from_slice(payload);
        let flags = match wait {
            Wait::Block => 0,
            Wait::NoWait => libc::IPC_NOWAIT,
        };

        loop {
            // Safety: buf is a live MsgBuf whose text holds at least payload.len() bytes.
            let rv = unsafe {
                libc::msgsnd(
                    self.id,
                    (&*buf as *const MsgBuf).cast::<libc::c_void>(),
                    payload.len(),
                    flags,
                )
            };
            if rv == 0 {
                return Ok(());
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Err(ChannelError::Full),
                _ => return Err(map_errno(err)),
            }
        }
    }

    fn recv(&self, wait: Wait) -> Result<Bytes, ChannelError> {
        let mut buf = MsgBuf::new();
        let flags = match wait {
            Wait::Block => libc::MSG_NOERROR,
            Wait::NoWait => libc::MSG_NOERROR | libc::IPC_NOWAIT,
        };

        loop {
            // Safety: buf has room for MAX_CHUNK bytes of text; MSG_NOERROR truncates longer messages.
            let rv = unsafe {
                libc::msgrcv(
                    self.id,
                    (&mut *buf as *mut MsgBuf).cast::<libc::c_void>(),
                    MAX_CHUNK,
                    MESSAGE_TYPE as libc::c_long,
                    flags,
                )
            };
            if rv >= 0 {
                let len = rv as usize;
                return Ok(Bytes::copy_from_slice(&buf.mtext[..len]));
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ENOMSG) => return Err(ChannelError::Empty),
                _ => return Err(map_errno(err)),
            }
        }
    }

    fn destroy(&self) -> Result<(), ChannelError> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Safety: IPC_RMID ignores the buffer argument.
        let rv = unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rv == -1 {
            let err = io::Error::last_os_error();
            // Someone else already removed it.
            if matches!(err.raw_os_error(), Some(libc::EIDRM) | Some(libc::EINVAL)) {
                return Ok(());
            }
            return Err(ChannelError::Io(err));
        }

        tracing::debug!(key = %self.key, id = self.id, "Removed queue");
        Ok(())
    }
}

impl Drop for SysvQueue {
    fn drop(&mut self) {
        if self.owner
            && let Err(e) = self.destroy()
        {
            tracing::warn!(error = %e, id = self.id, "Failed to remove IPC queue");
        }
    }
}
