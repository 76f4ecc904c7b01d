//! Process supervisor - owns the child, its pipes and the output pump.
//!
//! Lifecycle:
//! 1. `start`: fork/exec with handshake, spawn the output pump
//! 2. `write_to_stdin`: serialized writes from the receive loop
//! 3. `terminate`: close stdin → SIGTERM → SIGKILL, reap, join the pump
//!
//! One lock (the child slot) serializes stdin writes against termination, so
//! stdin is never closed underneath an in-flight write, and the pid is only
//! reset while holding it.

mod pump;
mod spawn;

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::channel::Queue;
use pump::{PumpConfig, PumpHandle};

pub use spawn::ChildCommand;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("child process already started")]
    AlreadyStarted,
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("failed to create pipes: {0}")]
    Pipe(#[source] io::Error),
    #[error("failed to fork: {0}")]
    Fork(#[source] io::Error),
    #[error("failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("lost exec handshake with child: {0}")]
    Handshake(#[source] io::Error),
    #[error("failed to start output pump: {0}")]
    Pump(#[source] io::Error),
}

impl StartError {
    /// Process exit code reported by `ipc-server` for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exec { .. } | Self::Handshake(_) => 253,
            _ => 254,
        }
    }
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ChildStatus {
    /// Shell convention: the exit code, or 128 + signal number.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(sig) => 128 + *sig as i32,
        }
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {}", code),
            Self::Signaled(sig) => write!(f, "killed by {}", sig),
        }
    }
}

/// Furthest escalation step `terminate` needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TerminationStage {
    /// No child was running.
    NotRunning,
    /// The child exited after its stdin closed.
    StdinClosed,
    /// SIGTERM was sent.
    Terminated,
    /// SIGKILL was required.
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationReport {
    pub stage: TerminationStage,
    /// `None` when there was no child, or it was reaped elsewhere.
    pub status: Option<ChildStatus>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Scheduling priority adjustment applied in the child before exec.
    pub nice: i32,
    /// Wait after closing stdin before checking on the child.
    pub stdin_grace: Duration,
    /// Wait after SIGTERM before escalating to SIGKILL.
    pub term_grace: Duration,
    /// Readiness wait used by the output pump.
    pub poll_timeout: Duration,
    pub write_retry_delay: Duration,
    /// Consecutive stalled attempts before a stdin write gives up.
    pub write_retry_limit: u32,
    pub send_retry_delay: Duration,
    pub send_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            nice: 0,
            stdin_grace: Duration::from_millis(200),
            term_grace: Duration::from_millis(250),
            poll_timeout: Duration::from_millis(10),
            write_retry_delay: Duration::from_millis(10),
            write_retry_limit: 500,
            send_retry_delay: Duration::from_millis(50),
            send_attempts: 10,
        }
    }
}

impl SupervisorConfig {
    pub fn with_nice(mut self, nice: i32) -> Self {
        self.nice = nice;
        self
    }

    pub fn with_grace_periods(mut self, stdin_grace: Duration, term_grace: Duration) -> Self {
        self.stdin_grace = stdin_grace;
        self.term_grace = term_grace;
        self
    }

    pub fn with_write_retry(mut self, delay: Duration, limit: u32) -> Self {
        self.write_retry_delay = delay;
        self.write_retry_limit = limit;
        self
    }

    pub fn with_send_retry(mut self, delay: Duration, attempts: u32) -> Self {
        self.send_retry_delay = delay;
        self.send_attempts = attempts;
        self
    }

    fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            poll_timeout: self.poll_timeout,
            send_attempts: self.send_attempts,
            send_retry_delay: self.send_retry_delay,
        }
    }
}

#[derive(Default)]
struct ChildSlot {
    started: bool,
    pid: Option<Pid>,
    stdin: Option<File>,
    pump: Option<PumpHandle>,
    status: Option<ChildStatus>,
}

impl ChildSlot {
    /// Reap the child if it has exited. Returns true while it is still alive.
    fn reap(&mut self, flags: Option<WaitPidFlag>) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };

        loop {
            match waitpid(pid, flags) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.record(ChildStatus::Exited(code));
                    return false;
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.record(ChildStatus::Signaled(sig));
                    return false;
                }
                Ok(_) if flags.is_some() => return true,
                // Stop/continue notifications; keep waiting for the real exit.
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    tracing::debug!(%pid, "Child already reaped");
                    self.pid = None;
                    return false;
                }
                Err(e) => {
                    tracing::error!(%pid, error = %e, "Failed to wait for child, abandoning it");
                    self.pid = None;
                    return false;
                }
            }
        }
    }

    fn record(&mut self, status: ChildStatus) {
        if let Some(pid) = self.pid.take() {
            tracing::debug!(%pid, %status, "Child reaped");
        }
        self.status = Some(status);
    }

    fn signal(&self, sig: Signal) {
        if let Some(pid) = self.pid
            && let Err(e) = kill(pid, sig)
        {
            tracing::debug!(%pid, signal = %sig, error = %e, "Failed to signal child");
        }
    }
}

/// Supervises a single launch of a child process.
pub struct Supervisor {
    config: SupervisorConfig,
    outbound: Arc<dyn Queue>,
    child: Mutex<ChildSlot>,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    /// `outbound` receives everything the child writes to stdout/stderr.
    pub fn new(config: SupervisorConfig, outbound: Arc<dyn Queue>) -> Self {
        Self {
            config,
            outbound,
            child: Mutex::new(ChildSlot::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock_child(&self) -> MutexGuard<'_, ChildSlot> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Child slot mutex poisoned - continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    /// Launch the child and start pumping its output.
    ///
    /// Returns [`StartError::Exec`] when the program could not be executed;
    /// that outcome comes from the handshake pipe and never from the child's
    /// later behaviour.
    pub fn start(&self, command: &ChildCommand) -> Result<(), StartError> {
        let mut slot = self.lock_child();
        if slot.started {
            return Err(StartError::AlreadyStarted);
        }

        let spawned = spawn::spawn(command, self.config.nice)?;
        slot.started = true;
        slot.pid = Some(spawned.pid);

        let stdin = File::from(spawned.stdin);
        if let Err(e) = pump::set_nonblocking(stdin.as_fd()) {
            tracing::warn!(error = %e, "Child stdin stays blocking");
        }
        slot.stdin = Some(stdin);

        match pump::spawn(
            spawned.output,
            Arc::clone(&self.outbound),
            Arc::clone(&self.shutdown),
            self.config.pump_config(),
        ) {
            Ok(handle) => {
                slot.pump = Some(handle);
                tracing::info!(pid = %spawned.pid, program = %command.program().display(), "Child running");
                Ok(())
            }
            Err(e) => {
                drop(slot);
                self.terminate();
                Err(StartError::Pump(e))
            }
        }
    }

    /// Write `data` to the child's stdin, returning how many bytes went in.
    ///
    /// A short count means the stream has a problem (child gone, pipe broken
    /// or stalled); it is not raised as an error. Returns 0 once stdin has
    /// been closed by `terminate`.
    pub fn write_to_stdin(&self, data: &[u8]) -> usize {
        let mut slot = self.lock_child();
        let Some(stdin) = slot.stdin.as_mut() else {
            tracing::debug!(bytes = data.len(), "Child stdin closed, dropping input");
            return 0;
        };

        let mut written = 0;
        let mut stalled = 0;
        while written < data.len() {
            match stdin.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => {
                    written += n;
                    stalled = 0;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    stalled += 1;
                    if stalled >= self.config.write_retry_limit {
                        tracing::warn!(written, total = data.len(), "Child stdin stalled");
                        break;
                    }
                    thread::sleep(self.config.write_retry_delay);
                }
                Err(e) => {
                    tracing::warn!(error = %e, written, total = data.len(), "Write to child stdin failed");
                    break;
                }
            }
        }

        if written == data.len() {
            // Pipes reject fsync with EINVAL; this is best-effort.
            let _ = stdin.sync_data();
        }
        written
    }

    /// Escalating, idempotent shutdown of the child.
    ///
    /// 1. close stdin, wait `stdin_grace`, reap if exited
    /// 2. SIGTERM, wait `term_grace`, reap if exited
    /// 3. SIGKILL
    /// 4. blocking reap, then join the output pump
    pub fn terminate(&self) -> TerminationReport {
        let mut slot = self.lock_child();

        if slot.stdin.take().is_some() {
            tracing::debug!("Closed child stdin");
        }

        let mut stage = TerminationStage::NotRunning;

        if slot.pid.is_some() {
            stage = TerminationStage::StdinClosed;
            thread::sleep(self.config.stdin_grace);
            thread::yield_now();
            slot.reap(Some(WaitPidFlag::WNOHANG));
        }

        if slot.pid.is_some() {
            stage = TerminationStage::Terminated;
            slot.signal(Signal::SIGTERM);
            thread::sleep(self.config.term_grace);
            thread::yield_now();
            slot.reap(Some(WaitPidFlag::WNOHANG));
        }

        if slot.pid.is_some() {
            stage = TerminationStage::Killed;
            tracing::warn!("Process is still running! trying SIGKILL");
            slot.signal(Signal::SIGKILL);
        }

        slot.reap(None);

        if let Some(pump) = slot.pump.take() {
            let exit = pump.cancel_and_join();
            tracing::debug!(?exit, "Output pump joined");
        }

        let report = TerminationReport {
            stage,
            status: if stage == TerminationStage::NotRunning {
                None
            } else {
                slot.status
            },
        };
        if stage != TerminationStage::NotRunning {
            tracing::info!(stage = ?report.stage, status = ?report.status, "Child terminated");
        }
        report
    }

    /// Set once the output pump has stopped (child EOF or pump failure). Never cleared.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.lock_child().pid.is_some()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.lock_child().pid
    }

    /// Exit status of the child, once reaped.
    pub fn status(&self) -> Option<ChildStatus> {
        self.lock_child().status
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let live = self.lock_child().pid.is_some();
        if live {
            tracing::warn!("Supervisor dropped with a live child, terminating");
            self.terminate();
        }
    }
}
