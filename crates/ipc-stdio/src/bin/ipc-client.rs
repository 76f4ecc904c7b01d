//! ipc-client - connect a terminal to a running ipc-server.

use std::io;
use std::path::PathBuf;
use std::sync::LazyLock;

use clap::Parser;

use ipc_stdio::{ClientConfig, ClientError, DEFAULT_QUEUE_PATH, QUEUE_PATH_ENV, Relay, VersionInfo};

static LONG_VERSION: LazyLock<String> = LazyLock::new(|| VersionInfo::new().long_version());

#[derive(Parser, Debug)]
#[command(name = "ipc-client")]
#[command(version = ipc_stdio::VERSION, long_version = LONG_VERSION.as_str())]
#[command(about = "Connect to an ipc-server")]
struct Cli {
    /// Existing file or directory naming the queue pair
    #[arg(short = 'q', long = "queuename", env = QUEUE_PATH_ENV, default_value = DEFAULT_QUEUE_PATH)]
    queue: PathBuf,
}

fn run(cli: &Cli) -> anyhow::Result<u64> {
    let relay = Relay::connect(ClientConfig::default(), &cli.queue)?;
    let sent = relay.run(io::stdin().lock(), io::stdout())?;
    Ok(sent)
}

/// Error messages already embed their causes, so only the outer one is printed.
fn describe(err: &anyhow::Error) -> String {
    err.to_string()
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ClientError>()
        .map(|e| e.exit_code())
        .unwrap_or(1)
}

fn main() {
    let cli = Cli::parse();
    ipc_stdio::logging::init_tracing();

    let code = match run(&cli) {
        Ok(sent) => {
            tracing::debug!(sent, "Input closed, exiting");
            0
        }
        Err(e) => {
            tracing::error!("{}", describe(&e));
            exit_code(&e)
        }
    };
    std::process::exit(code);
}
