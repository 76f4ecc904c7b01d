//! ipc-stdio: expose a child process's stdin/stdout over System V message queues.

pub mod channel;
pub mod client;
pub mod logging;
pub mod server;
pub mod supervisor;
mod version;

pub use channel::{ChannelError, Duplex, MAX_CHUNK, MemoryQueue, Queue, SysvQueue, Wait};
pub use client::{ChannelLossAction, ClientConfig, ClientError, Relay};
pub use server::{
    DEFAULT_QUEUE_PATH, QUEUE_PATH_ENV, ServeOutcome, Server, ServerConfig, ServerError, serve,
};
pub use supervisor::{
    ChildCommand, ChildStatus, StartError, Supervisor, SupervisorConfig, TerminationReport,
    TerminationStage,
};
pub use version::{VERSION, VersionInfo};
