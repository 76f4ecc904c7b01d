//! Output pump: child stdout/stderr → outbound queue.
//!
//! Runs on its own OS thread. The read end is non-blocking; an empty pipe
//! parks the thread in poll(2) for at most `poll_timeout` so the cancellation
//! token is observed promptly even when a grandchild keeps the pipe open.
//!
//! Every exit path raises the shared shutdown flag.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, MAX_CHUNK, Queue, Wait};

/// Why the pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// Every writer of the output pipe closed it.
    Eof,
    Read(io::Error),
    Poll(Errno),
    Send(ChannelError),
    Cancelled,
}

#[derive(Debug, Clone)]
pub(crate) struct PumpConfig {
    pub poll_timeout: Duration,
    pub send_attempts: u32,
    pub send_retry_delay: Duration,
}

pub(crate) struct PumpHandle {
    cancel: CancellationToken,
    join: JoinHandle<PumpExit>,
}

impl PumpHandle {
    /// Ask the pump to stop and wait for it.
    pub fn cancel_and_join(self) -> Option<PumpExit> {
        self.cancel.cancel();
        match self.join.join() {
            Ok(exit) => Some(exit),
            Err(_) => {
                tracing::error!("Output pump panicked");
                None
            }
        }
    }
}

pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

pub(crate) fn spawn(
    output: OwnedFd,
    outbound: Arc<dyn Queue>,
    shutdown: Arc<AtomicBool>,
    config: PumpConfig,
) -> io::Result<PumpHandle> {
    set_nonblocking(output.as_fd())?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let join = thread::Builder::new()
        .name("output-pump".to_string())
        .spawn(move || {
            let exit = run(File::from(output), outbound.as_ref(), &token, &config);
            shutdown.store(true, Ordering::Release);
            match &exit {
                PumpExit::Eof | PumpExit::Cancelled => tracing::debug!(?exit, "Output pump exiting"),
                PumpExit::Read(e) => tracing::warn!(error = %e, "Output pump stopped: read failed"),
                PumpExit::Poll(errno) => tracing::warn!(error = %errno, "Output pump stopped: poll failed"),
                PumpExit::Send(e) => tracing::warn!(error = %e, "Output pump stopped: send failed"),
            }
            exit
        })?;

    Ok(PumpHandle { cancel, join })
}

fn run(
    mut output: File,
    outbound: &dyn Queue,
    cancel: &CancellationToken,
    config: &PumpConfig,
) -> PumpExit {
    // One byte short of a full message.
    let mut buf = vec![0u8; MAX_CHUNK - 1];
    let timeout_ms = u16::try_from(config.poll_timeout.as_millis()).unwrap_or(u16::MAX);

    loop {
        if cancel.is_cancelled() {
            return PumpExit::Cancelled;
        }

        match output.read(&mut buf) {
            Ok(0) => return PumpExit::Eof,
            Ok(n) => {
                tracing::trace!(bytes = n, "Forwarding child output");
                if let Err(e) = forward(outbound, &buf[..n], config) {
                    return PumpExit::Send(e);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                let mut fds = [PollFd::new(output.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                    Ok(_) | Err(Errno::EINTR) => continue,
                    Err(errno) => return PumpExit::Poll(errno),
                }
            }
            Err(e) => return PumpExit::Read(e),
        }
    }
}

/// Non-blocking send, retried while the queue is full.
fn forward(outbound: &dyn Queue, chunk: &[u8], config: &PumpConfig) -> Result<(), ChannelError> {
    let attempts = config.send_attempts.max(1);
    let mut attempt = 1;
    loop {
        match outbound.send(chunk, Wait::NoWait) {
            Err(e) if e.is_transient() && attempt < attempts => {
                attempt += 1;
                thread::sleep(config.send_retry_delay);
            }
            result => return result,
        }
    }
}
