//! Server side of the bridge: owns the channel, runs the child, relays input.
//!
//! Flow:
//! 1. Create both queues from the naming path
//! 2. Install SIGINT/SIGTERM handlers (they only raise a flag)
//! 3. Start the child under a [`Supervisor`]
//! 4. Receive loop: inbound messages → child stdin until the child exits or a
//!    signal arrives
//! 5. Terminate the child, remove the queues

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use signal_hook::SigId;
use signal_hook::consts::{SIGINT, SIGTERM};

use crate::channel::{ChannelError, Duplex, Queue, Wait};
use crate::supervisor::{
    ChildCommand, StartError, Supervisor, SupervisorConfig, TerminationReport,
};

/// Naming path used when none is given.
pub const DEFAULT_QUEUE_PATH: &str = "/tmp";

/// Environment variable overriding [`DEFAULT_QUEUE_PATH`] for both binaries.
pub const QUEUE_PATH_ENV: &str = "IPC_STDIO_QUEUE";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot open IPC channel at {path}: {source}")]
    Channel {
        path: String,
        #[source]
        source: ChannelError,
    },
    #[error("failed to start child process: {0}")]
    Start(#[from] StartError),
    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),
    #[error("receive from client failed: {0}")]
    Receive(#[source] ChannelError),
}

impl ServerError {
    /// Process exit code reported by `ipc-server`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Channel { .. } => 255,
            Self::Start(e) => e.exit_code(),
            Self::Signal(_) => 254,
            Self::Receive(_) => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub queue_path: PathBuf,
    pub supervisor: SupervisorConfig,
    /// Sleep between polls of an empty inbound queue.
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_path: PathBuf::from(DEFAULT_QUEUE_PATH),
            supervisor: SupervisorConfig::default(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ServerConfig {
    pub fn new(queue_path: impl Into<PathBuf>) -> Self {
        Self {
            queue_path: queue_path.into(),
            ..Self::default()
        }
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Why the receive loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The child closed its output (the pump raised the shutdown flag).
    ChildExited,
    /// SIGINT or SIGTERM.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeOutcome {
    pub exit: LoopExit,
    pub report: TerminationReport,
}

impl ServeOutcome {
    /// The child's exit status as a process exit code.
    pub fn exit_code(&self) -> i32 {
        self.report.status.map(|s| s.exit_code()).unwrap_or(0)
    }
}

/// Relay inbound messages to the child's stdin until the child goes away or
/// `interrupt` is raised.
///
/// An empty queue is polled every `poll_interval`. Any channel error other
/// than "empty" ends the loop with [`ServerError::Receive`].
pub fn run_receive_loop(
    supervisor: &Supervisor,
    inbound: &dyn Queue,
    interrupt: &AtomicBool,
    poll_interval: Duration,
) -> Result<LoopExit, ServerError> {
    loop {
        if interrupt.load(Ordering::Acquire) {
            tracing::warn!("Caught signal, shutting down");
            return Ok(LoopExit::Interrupted);
        }

        match inbound.recv(Wait::NoWait) {
            Ok(payload) => {
                let written = supervisor.write_to_stdin(&payload);
                if written < payload.len() {
                    tracing::warn!(written, len = payload.len(), "Short write to child stdin");
                }
            }
            Err(ChannelError::Empty) => {
                if supervisor.is_shutdown() {
                    tracing::info!("Child terminated");
                    return Ok(LoopExit::ChildExited);
                }
                thread::sleep(poll_interval);
            }
            Err(e) => {
                tracing::error!(error = %e, "Receive from client failed");
                return Err(ServerError::Receive(e));
            }
        }
    }
}

/// Registered signal actions, removed on drop.
pub struct SignalGuard {
    ids: Vec<SigId>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Raise `flag` on SIGINT or SIGTERM instead of dying.
pub fn install_signal_handlers(flag: &Arc<AtomicBool>) -> Result<SignalGuard, ServerError> {
    let mut guard = SignalGuard { ids: Vec::new() };
    for signal in [SIGINT, SIGTERM] {
        let id = signal_hook::flag::register(signal, Arc::clone(flag)).map_err(ServerError::Signal)?;
        guard.ids.push(id);
    }
    Ok(guard)
}

/// One server run over an already opened channel.
pub struct Server {
    config: ServerConfig,
    channel: Duplex,
    interrupt: Arc<AtomicBool>,
}

impl Server {
    /// Create the kernel queues named by `config.queue_path`.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let channel =
            Duplex::create_server(&config.queue_path).map_err(|source| ServerError::Channel {
                path: config.queue_path.display().to_string(),
                source,
            })?;
        Ok(Self::with_channel(config, channel))
    }

    /// Run over the server side of an existing channel pair.
    pub fn with_channel(config: ServerConfig, channel: Duplex) -> Self {
        Self {
            config,
            channel,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the receive loop when raised.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn install_signal_handlers(&self) -> Result<SignalGuard, ServerError> {
        install_signal_handlers(&self.interrupt)
    }

    /// Start `command` and relay until it exits or the interrupt flag is raised.
    ///
    /// The child is always terminated and the queues always removed before
    /// this returns, whatever the outcome.
    pub fn run(self, command: &ChildCommand) -> Result<ServeOutcome, ServerError> {
        let supervisor = Supervisor::new(
            self.config.supervisor.clone(),
            Arc::clone(&self.channel.outbound),
        );

        let result = match supervisor.start(command) {
            Ok(()) => run_receive_loop(
                &supervisor,
                self.channel.inbound.as_ref(),
                &self.interrupt,
                self.config.poll_interval,
            ),
            Err(e) => Err(e.into()),
        };

        let report = supervisor.terminate();
        if let Err(e) = self.channel.destroy() {
            tracing::warn!(error = %e, "Failed to remove IPC queues");
        }

        result.map(|exit| ServeOutcome { exit, report })
    }
}

/// Open the channel, install signal handlers and run `command` to completion.
pub fn serve(config: ServerConfig, command: &ChildCommand) -> Result<ServeOutcome, ServerError> {
    let server = Server::open(config)?;
    let _signals = server.install_signal_handlers()?;
    server.run(command)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread::JoinHandle;
    use std::time::Instant;

    use bytes::Bytes;

    use super::*;
    use crate::supervisor::{ChildStatus, TerminationStage};

    fn test_config() -> ServerConfig {
        ServerConfig::new("/unused")
            .with_poll_interval(Duration::from_millis(10))
            .with_supervisor(SupervisorConfig::default().with_grace_periods(
                Duration::from_millis(100),
                Duration::from_millis(100),
            ))
    }

    /// Drain a queue on a background thread until it is removed.
    fn collector(queue: Arc<dyn Queue>) -> (Arc<Mutex<Vec<u8>>>, JoinHandle<()>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&sink);
        let handle = thread::spawn(move || {
            while let Ok(chunk) = queue.recv(Wait::Block) {
                out.lock().unwrap().extend_from_slice(&chunk);
            }
        });
        (sink, handle)
    }

    fn wait_for(sink: &Mutex<Vec<u8>>, want: &[u8]) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if sink.lock().unwrap().as_slice() == want {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn echo_child_answers_client() {
        let (server_side, client_side) = Duplex::memory(64);
        let server = Server::with_channel(test_config(), server_side);
        let interrupt = server.interrupt_flag();
        let (sink, reader) = collector(Arc::clone(&client_side.inbound));

        let run = thread::spawn(move || server.run(&ChildCommand::new("/bin/cat")));

        client_side.outbound.send(b"ping\n", Wait::NoWait).unwrap();
        assert!(wait_for(&sink, b"ping\n"));

        interrupt.store(true, Ordering::Release);
        let outcome = run.join().unwrap().unwrap();
        reader.join().unwrap();

        assert_eq!(outcome.exit, LoopExit::Interrupted);
        assert_eq!(outcome.report.stage, TerminationStage::StdinClosed);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn child_exit_ends_loop_with_its_status() {
        let (server_side, client_side) = Duplex::memory(64);
        let server = Server::with_channel(test_config(), server_side);
        let (sink, reader) = collector(Arc::clone(&client_side.inbound));

        let outcome = server.run(&ChildCommand::shell("echo done; exit 7")).unwrap();
        reader.join().unwrap();

        assert_eq!(outcome.exit, LoopExit::ChildExited);
        assert_eq!(outcome.report.status, Some(ChildStatus::Exited(7)));
        assert_eq!(outcome.exit_code(), 7);
        assert_eq!(sink.lock().unwrap().as_slice(), b"done\n");
    }

    #[test]
    fn exec_failure_skips_receive_loop() {
        let (server_side, client_side) = Duplex::memory(4);
        let server = Server::with_channel(test_config(), server_side);

        let err = server
            .run(&ChildCommand::new("/nonexistent/ipc-stdio-server-test"))
            .unwrap_err();

        assert!(matches!(err, ServerError::Start(StartError::Exec { .. })));
        assert_eq!(err.exit_code(), 253);
        // Queues are gone either way.
        assert!(matches!(
            client_side.outbound.send(b"x", Wait::NoWait),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn removed_queue_is_a_receive_failure() {
        let (server_side, client_side) = Duplex::memory(4);
        let server = Server::with_channel(test_config(), server_side);

        let run = thread::spawn(move || server.run(&ChildCommand::new("/bin/cat")));
        thread::sleep(Duration::from_millis(50));
        client_side.outbound.destroy().unwrap();

        let err = run.join().unwrap().unwrap_err();
        assert!(matches!(err, ServerError::Receive(ChannelError::Closed)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn interrupt_is_checked_before_receiving() {
        let (server_side, client_side) = Duplex::memory(4);
        let supervisor = Supervisor::new(SupervisorConfig::default(), server_side.outbound);
        client_side.outbound.send(b"never read", Wait::NoWait).unwrap();

        let exit = run_receive_loop(
            &supervisor,
            server_side.inbound.as_ref(),
            &AtomicBool::new(true),
            Duration::from_millis(10),
        )
        .unwrap();

        assert_eq!(exit, LoopExit::Interrupted);
        assert_eq!(
            server_side.inbound.recv(Wait::NoWait).unwrap(),
            Bytes::from_static(b"never read")
        );
    }

    #[test]
    fn sigterm_raises_interrupt_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = install_signal_handlers(&flag).unwrap();

        signal_hook::low_level::raise(SIGTERM).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        while !flag.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(flag.load(Ordering::Acquire));
        drop(guard);
    }

    #[test]
    fn open_fails_for_missing_path() {
        let err = Server::open(ServerConfig::new("/nonexistent/ipc-stdio-queue-path"))
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 255);
        assert!(matches!(
            err,
            ServerError::Channel {
                source: ChannelError::Key { .. },
                ..
            }
        ));
    }

    #[test]
    fn error_messages() {
        let err = ServerError::Receive(ChannelError::Closed);
        insta::assert_snapshot!(err, @"receive from client failed: queue was removed");
    }
}
