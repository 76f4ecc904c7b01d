//! Fork/exec with exec-failure detection.
//!
//! Three pipes are created before forking, all close-on-exec:
//!
//! - **stdin**: parent writes, child reads as fd 0
//! - **output**: child writes as fd 1 and fd 2, parent reads
//! - **handshake**: used once, to learn whether exec succeeded
//!
//! The handshake reads backwards on purpose. The parent blocks on a one-byte
//! read from the handshake pipe:
//!
//! - **EOF (0 bytes)**: exec succeeded. The child's copy of the write end was
//!   close-on-exec, so the kernel closed it when the new image loaded.
//! - **1 byte**: exec failed. The child wrote the low byte of errno and exited.
//!
//! Silence is success. Reading zero bytes is not an error here.
//!
//! ## Safety contracts
//!
//! The child branch runs in a copy of a multi-threaded process, so between
//! fork and exec it only calls async-signal-safe functions (dup2, fcntl,
//! signal, nice, execv, write, _exit). Everything it touches (argv pointers,
//! descriptors) is prepared before the fork.

use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork, pipe2};

use super::StartError;

const SHELL_PATH: &str = "/bin/sh";

/// Exit status used by the child when exec fails.
const EXEC_FAILED_STATUS: libc::c_int = 127;

/// Program and arguments for the supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ChildCommand {
    /// Run `program` directly. The path is used as-is, no `PATH` search.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Run `command_line` through `/bin/sh -c`.
    pub fn shell(command_line: impl Into<OsString>) -> Self {
        Self::new(SHELL_PATH).arg("-c").arg(command_line)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }
}

/// Parent-side ends of a successfully launched child.
pub(crate) struct Spawned {
    pub pid: Pid,
    pub stdin: OwnedFd,
    pub output: OwnedFd,
}

fn to_cstring(s: &OsStr) -> Result<CString, StartError> {
    CString::new(s.as_bytes())
        .map_err(|_| StartError::InvalidCommand(format!("{:?} contains a NUL byte", s)))
}

pub(crate) fn spawn(command: &ChildCommand, nice: i32) -> Result<Spawned, StartError> {
    let program = to_cstring(command.program.as_os_str())?;
    let mut argv = Vec::with_capacity(command.args.len() + 1);
    argv.push(program.clone());
    for arg in &command.args {
        argv.push(to_cstring(arg)?);
    }
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let (stdin_read, stdin_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| StartError::Pipe(e.into()))?;
    let (output_read, output_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| StartError::Pipe(e.into()))?;
    let (handshake_read, handshake_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| StartError::Pipe(e.into()))?;

    tracing::trace!(
        stdin_read = stdin_read.as_raw_fd(),
        stdin_write = stdin_write.as_raw_fd(),
        output_read = output_read.as_raw_fd(),
        output_write = output_write.as_raw_fd(),
        handshake_read = handshake_read.as_raw_fd(),
        handshake_write = handshake_write.as_raw_fd(),
        "Created pipes"
    );

    // Safety: the child branch only runs exec_child, which is async-signal-safe
    // and never returns.
    let fork_result = unsafe { fork() }.map_err(|e| StartError::Fork(e.into()))?;

    match fork_result {
        ForkResult::Child => unsafe {
            exec_child(
                stdin_read.as_raw_fd(),
                output_write.as_raw_fd(),
                handshake_write.as_raw_fd(),
                nice,
                &program,
                &argv_ptrs,
            )
        },
        ForkResult::Parent { child } => {
            // Child-facing ends now belong to the child alone.
            drop(stdin_read);
            drop(output_write);
            drop(handshake_write);

            match read_handshake(handshake_read) {
                Ok(None) => {
                    tracing::debug!(pid = %child, program = %command.program.display(), "Child started");
                    Ok(Spawned {
                        pid: child,
                        stdin: stdin_write,
                        output: output_read,
                    })
                }
                Ok(Some(errno)) => {
                    // The child is already on its way to _exit.
                    let _ = waitpid(child, None);
                    let errno = if errno == 0 { libc::ENOEXEC } else { i32::from(errno) };
                    Err(StartError::Exec {
                        program: command.program.display().to_string(),
                        source: io::Error::from_raw_os_error(errno),
                    })
                }
                Err(e) => {
                    let _ = kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                    Err(StartError::Handshake(e))
                }
            }
        }
    }
}

/// `Ok(None)` on EOF (exec succeeded), `Ok(Some(errno))` when the child
/// reported an exec failure.
fn read_handshake(fd: OwnedFd) -> io::Result<Option<u8>> {
    let mut pipe = File::from(fd);
    let mut byte = [0u8; 1];
    loop {
        match pipe.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Point `target` at `fd`. dup2 onto itself keeps close-on-exec set, so that
/// case clears the flag instead.
unsafe fn redirect(fd: RawFd, target: RawFd) -> bool {
    unsafe {
        if fd == target {
            libc::fcntl(fd, libc::F_SETFD, 0) != -1
        } else {
            libc::dup2(fd, target) != -1
        }
    }
}

unsafe fn exec_child(
    stdin_read: RawFd,
    output_write: RawFd,
    handshake_write: RawFd,
    nice: i32,
    program: &CString,
    argv: &[*const libc::c_char],
) -> ! {
    unsafe {
        let redirected = redirect(stdin_read, libc::STDIN_FILENO)
            && redirect(output_write, libc::STDOUT_FILENO)
            && redirect(output_write, libc::STDERR_FILENO);

        if redirected {
            // Rust ignores SIGPIPE and exec preserves ignored dispositions.
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);

            if nice != 0 {
                libc::nice(nice);
            }

            libc::execv(program.as_ptr(), argv.as_ptr());
        }

        // Only reachable when exec (or the redirection before it) failed.
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        let sentinel = errno as u8;
        libc::write(handshake_write, (&sentinel as *const u8).cast::<libc::c_void>(), 1);
        libc::_exit(EXEC_FAILED_STATUS);
    }
}
