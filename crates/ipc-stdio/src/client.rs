//! Client relay: local stdin → server, server → local stdout.
//!
//! Two threads share the attached channel:
//!
//! - **reader**: drains the to-client queue into the output stream, flushing
//!   after every chunk
//! - **writer** (caller's thread): reads input lines and sends them with a
//!   bounded non-blocking retry
//!
//! Input EOF cancels and joins the reader. Losing the channel on the reader
//! side hangs up the whole process group unless configured otherwise.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, Duplex, MAX_CHUNK, Queue, Wait};

/// Largest piece of an input line sent as one message.
pub const LINE_CHUNK: usize = MAX_CHUNK - 1;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot open IPC channel at {path}: {source}")]
    Channel {
        path: String,
        #[source]
        source: ChannelError,
    },
    #[error("cannot start background read thread: {0}")]
    ReaderSpawn(#[source] io::Error),
    #[error("send to server failed after {attempts} attempts: {source}")]
    Send {
        attempts: u32,
        #[source]
        source: ChannelError,
    },
    #[error("lost connection to server")]
    ChannelLost,
    #[error("failed to read input: {0}")]
    Input(#[source] io::Error),
}

impl ClientError {
    /// Process exit code reported by `ipc-client`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Channel { .. } => 255,
            Self::ReaderSpawn(_) => 254,
            Self::Send { .. } | Self::ChannelLost | Self::Input(_) => 1,
        }
    }
}

/// What the reader does when the server side goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLossAction {
    /// SIGHUP to the whole process group, ending the client immediately.
    HangupProcessGroup,
    /// Stop reading; the next send reports [`ClientError::ChannelLost`].
    Stop,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub send_attempts: u32,
    pub send_retry_delay: Duration,
    /// Reader sleep when the to-client queue is empty.
    pub poll_interval: Duration,
    pub loss_action: ChannelLossAction,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_attempts: 10,
            send_retry_delay: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            loss_action: ChannelLossAction::HangupProcessGroup,
        }
    }
}

impl ClientConfig {
    pub fn with_send_retry(mut self, delay: Duration, attempts: u32) -> Self {
        self.send_retry_delay = delay;
        self.send_attempts = attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_loss_action(mut self, action: ChannelLossAction) -> Self {
        self.loss_action = action;
        self
    }
}

/// Why the reader thread stopped.
#[derive(Debug)]
pub enum ReaderExit {
    Cancelled,
    ChannelLost(ChannelError),
    Output(io::Error),
}

pub struct ReaderHandle {
    cancel: CancellationToken,
    join: JoinHandle<ReaderExit>,
}

impl ReaderHandle {
    /// Stop the reader and wait for it. Chunks still queued stay queued.
    pub fn cancel_and_join(self) -> Option<ReaderExit> {
        self.cancel.cancel();
        match self.join.join() {
            Ok(exit) => Some(exit),
            Err(_) => {
                tracing::error!("Reader thread panicked");
                None
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub struct Relay {
    config: ClientConfig,
    channel: Duplex,
    lost: Arc<AtomicBool>,
}

impl Relay {
    /// Attach to the queues a server created for `path`.
    pub fn connect(config: ClientConfig, path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let channel = Duplex::attach_client(&path).map_err(|source| ClientError::Channel {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::with_channel(config, channel))
    }

    /// Relay over the client side of an existing channel pair.
    pub fn with_channel(config: ClientConfig, channel: Duplex) -> Self {
        Self {
            config,
            channel,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start copying server output into `out`.
    pub fn spawn_reader<W>(&self, out: W) -> Result<ReaderHandle, ClientError>
    where
        W: Write + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inbound = Arc::clone(&self.channel.inbound);
        let lost = Arc::clone(&self.lost);
        let poll_interval = self.config.poll_interval;
        let loss_action = self.config.loss_action;

        let join = thread::Builder::new()
            .name("client-reader".to_string())
            .spawn(move || {
                let exit = read_loop(inbound.as_ref(), out, &token, poll_interval);
                if !matches!(exit, ReaderExit::Cancelled) {
                    tracing::error!(?exit, "Reader stopped");
                    lost.store(true, Ordering::Release);
                    on_channel_loss(loss_action);
                }
                exit
            })
            .map_err(ClientError::ReaderSpawn)?;

        Ok(ReaderHandle { cancel, join })
    }

    /// Send `input` line by line until EOF. Returns the number of bytes sent.
    ///
    /// Lines longer than [`LINE_CHUNK`] go out as several messages.
    pub fn pump_input<R: BufRead>(&self, mut input: R) -> Result<u64, ClientError> {
        let mut line = Vec::with_capacity(LINE_CHUNK);
        let mut sent = 0u64;

        loop {
            line.clear();
            let n = match input.read_until(b'\n', &mut line) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ClientError::Input(e)),
            };
            if n == 0 {
                tracing::debug!(sent, "Input closed");
                return Ok(sent);
            }

            for chunk in line.chunks(LINE_CHUNK) {
                if self.lost.load(Ordering::Acquire) {
                    return Err(ClientError::ChannelLost);
                }
                self.send(chunk)?;
                sent += chunk.len() as u64;
            }
        }
    }

    fn send(&self, chunk: &[u8]) -> Result<(), ClientError> {
        let attempts = self.config.send_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.channel.outbound.send(chunk, Wait::NoWait) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < attempts => {
                    attempt += 1;
                    thread::sleep(self.config.send_retry_delay);
                }
                Err(source) => {
                    tracing::error!(error = %source, attempt, "Send to server failed");
                    return Err(ClientError::Send {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// Relay until `input` reaches EOF, then stop the reader.
    pub fn run<R, W>(&self, input: R, output: W) -> Result<u64, ClientError>
    where
        R: BufRead,
        W: Write + Send + 'static,
    {
        let reader = self.spawn_reader(output)?;
        let result = self.pump_input(input);
        if let Some(exit) = reader.cancel_and_join() {
            tracing::debug!(?exit, "Reader joined");
        }
        result
    }
}

fn read_loop<W: Write>(
    inbound: &dyn Queue,
    mut out: W,
    cancel: &CancellationToken,
    poll_interval: Duration,
) -> ReaderExit {
    loop {
        if cancel.is_cancelled() {
            return ReaderExit::Cancelled;
        }

        match inbound.recv(Wait::NoWait) {
            Ok(chunk) => {
                if let Err(e) = out.write_all(&chunk).and_then(|()| out.flush()) {
                    return ReaderExit::Output(e);
                }
            }
            Err(ChannelError::Empty) => thread::sleep(poll_interval),
            Err(e) => return ReaderExit::ChannelLost(e),
        }
    }
}

fn on_channel_loss(action: ChannelLossAction) {
    match action {
        ChannelLossAction::HangupProcessGroup => {
            // pid 0: every process in our process group
            if let Err(e) = kill(Pid::from_raw(0), Signal::SIGHUP) {
                tracing::error!(error = %e, "Failed to hang up process group");
            }
        }
        ChannelLossAction::Stop => {}
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;
    use crate::channel::MemoryQueue;
    use crate::server::{Server, ServerConfig};
    use crate::supervisor::{ChildCommand, SupervisorConfig};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }

        fn wait_for(&self, want: &[u8]) -> bool {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if self.contents() == want {
                    return true;
                }
                thread::sleep(Duration::from_millis(5));
            }
            false
        }
    }

    fn test_config() -> ClientConfig {
        ClientConfig::default()
            .with_send_retry(Duration::from_millis(1), 3)
            .with_poll_interval(Duration::from_millis(1))
            .with_loss_action(ChannelLossAction::Stop)
    }

    fn drain(queue: &dyn Queue) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(chunk) = queue.recv(Wait::NoWait) {
            out.push(chunk.to_vec());
        }
        out
    }

    #[test]
    fn lines_become_messages() {
        let (server, client) = Duplex::memory(16);
        let relay = Relay::with_channel(test_config(), client);

        let sent = relay.pump_input(Cursor::new(b"one\ntwo\nlast".to_vec())).unwrap();

        assert_eq!(sent, 12);
        assert_eq!(
            drain(server.inbound.as_ref()),
            vec![b"one\n".to_vec(), b"two\n".to_vec(), b"last".to_vec()]
        );
    }

    #[test]
    fn empty_input_sends_nothing() {
        let (server, client) = Duplex::memory(4);
        let relay = Relay::with_channel(test_config(), client);

        assert_eq!(relay.pump_input(Cursor::new(Vec::new())).unwrap(), 0);
        assert!(drain(server.inbound.as_ref()).is_empty());
    }

    #[test]
    fn long_line_is_split() {
        let (server, client) = Duplex::memory(16);
        let relay = Relay::with_channel(test_config(), client);

        let mut line = vec![b'x'; LINE_CHUNK * 2 + 10];
        line.push(b'\n');
        relay.pump_input(Cursor::new(line.clone())).unwrap();

        let chunks = drain(server.inbound.as_ref());
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= LINE_CHUNK));
        assert_eq!(chunks.concat(), line);
    }

    #[test]
    fn full_queue_exhausts_retries() {
        let to_server = Arc::new(MemoryQueue::new(1));
        let to_client = Arc::new(MemoryQueue::new(1));
        let channel = Duplex {
            inbound: to_client,
            outbound: to_server.clone(),
        };
        let relay = Relay::with_channel(test_config(), channel);

        let err = relay
            .pump_input(Cursor::new(b"first\nsecond\n".to_vec()))
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::Send {
                attempts: 3,
                source: ChannelError::Full
            }
        ));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(to_server.len(), 1);
    }

    #[test]
    fn reader_copies_output_until_cancelled() {
        let (server, client) = Duplex::memory(16);
        let relay = Relay::with_channel(test_config(), client);
        let out = SharedBuf::default();

        let reader = relay.spawn_reader(out.clone()).unwrap();
        server.outbound.send(b"hello ", Wait::NoWait).unwrap();
        server.outbound.send(b"world\n", Wait::NoWait).unwrap();

        assert!(out.wait_for(b"hello world\n"));
        assert!(matches!(reader.cancel_and_join(), Some(ReaderExit::Cancelled)));
    }

    #[test]
    fn lost_channel_stops_reader_and_input() {
        let (server, client) = Duplex::memory(16);
        let relay = Relay::with_channel(test_config(), client);

        let reader = relay.spawn_reader(io::sink()).unwrap();
        server.outbound.destroy().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !reader.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            reader.cancel_and_join(),
            Some(ReaderExit::ChannelLost(ChannelError::Closed))
        ));

        let err = relay.pump_input(Cursor::new(b"late\n".to_vec())).unwrap_err();
        assert!(matches!(err, ClientError::ChannelLost));
    }

    #[test]
    fn connect_without_server_fails_fast() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let started = Instant::now();

        let err = Relay::connect(ClientConfig::default(), file.path())
            .err()
            .unwrap();

        assert!(matches!(
            err,
            ClientError::Channel {
                source: ChannelError::Open(_),
                ..
            }
        ));
        assert_eq!(err.exit_code(), 255);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn ping_through_kernel_queues() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let server_config = ServerConfig::new(file.path())
            .with_poll_interval(Duration::from_millis(10))
            .with_supervisor(SupervisorConfig::default().with_grace_periods(
                Duration::from_millis(50),
                Duration::from_millis(50),
            ));
        let server = Server::open(server_config).unwrap();
        let interrupt = server.interrupt_flag();
        let run = thread::spawn(move || server.run(&ChildCommand::new("/bin/cat")));

        let relay = Relay::connect(test_config(), file.path()).unwrap();
        let out = SharedBuf::default();
        let reader = relay.spawn_reader(out.clone()).unwrap();

        relay.pump_input(Cursor::new(b"ping\n".to_vec())).unwrap();
        assert!(out.wait_for(b"ping\n"));

        reader.cancel_and_join();
        interrupt.store(true, Ordering::Release);
        let outcome = run.join().unwrap().unwrap();
        assert_eq!(outcome.exit_code(), 0);

        // The server removed its queues on the way out.
        assert!(Relay::connect(test_config(), file.path()).is_err());
    }

    #[test]
    fn error_messages() {
        let err = ClientError::Send {
            attempts: 10,
            source: ChannelError::Full,
        };
        insta::assert_snapshot!(err, @"send to server failed after 10 attempts: queue is full");
    }
}
