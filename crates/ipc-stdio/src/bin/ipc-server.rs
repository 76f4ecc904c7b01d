//! ipc-server - wrap the stdio of a child process in a pair of message queues.

use std::path::PathBuf;
use std::sync::LazyLock;

use clap::Parser;

use ipc_stdio::{
    ChildCommand, DEFAULT_QUEUE_PATH, QUEUE_PATH_ENV, ServerConfig, SupervisorConfig, VersionInfo,
};

static LONG_VERSION: LazyLock<String> = LazyLock::new(|| VersionInfo::new().long_version());

#[derive(Parser, Debug)]
#[command(name = "ipc-server")]
#[command(version = ipc_stdio::VERSION, long_version = LONG_VERSION.as_str())]
#[command(about = "Wrap the stdio of a child process")]
struct Cli {
    /// Existing file or directory naming the queue pair
    #[arg(short = 'q', long = "queuename", env = QUEUE_PATH_ENV, default_value = DEFAULT_QUEUE_PATH)]
    queue: PathBuf,

    /// Scheduling priority adjustment for the child
    #[arg(short = 'n', long, default_value_t = 0, allow_negative_numbers = true)]
    nice: i32,

    /// Run <command> through /bin/sh -c
    #[arg(long)]
    shell: bool,

    /// Program to run (no PATH lookup), then its arguments. Everything after
    /// the program belongs to the child, even when it looks like an option.
    #[arg(
        value_name = "COMMAND",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

impl Cli {
    fn child_command(&self) -> Option<ChildCommand> {
        let (program, args) = self.command.split_first()?;
        let command = if self.shell {
            let mut line = program.clone();
            for arg in args {
                line.push(' ');
                line.push_str(arg);
            }
            ChildCommand::shell(line)
        } else {
            ChildCommand::new(program).args(args)
        };
        Some(command)
    }
}

fn main() {
    let cli = Cli::parse();
    ipc_stdio::logging::init_tracing();

    let config = ServerConfig::new(&cli.queue)
        .with_supervisor(SupervisorConfig::default().with_nice(cli.nice));
    let Some(command) = cli.child_command() else {
        tracing::error!("Missing command");
        std::process::exit(2);
    };

    tracing::debug!(queue = %cli.queue.display(), ?command, "Starting server");

    let code = match ipc_stdio::serve(config, &command) {
        Ok(outcome) => {
            tracing::debug!(?outcome, "Server finished");
            outcome.exit_code()
        }
        Err(e) => {
            tracing::error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::path::Path;

    use super::*;

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(argv).unwrap()
    }

    fn child_args(cli: &Cli) -> Vec<OsString> {
        cli.child_command().unwrap().get_args().to_vec()
    }

    #[test]
    fn child_options_are_not_ours() {
        let cli = parse(&["ipc-server", "/bin/echo", "-n", "x"]);
        assert_eq!(cli.nice, 0);

        let command = cli.child_command().unwrap();
        assert_eq!(command.program(), Path::new("/bin/echo"));
        assert_eq!(child_args(&cli), vec![OsString::from("-n"), OsString::from("x")]);
    }

    #[test]
    fn server_options_before_the_command() {
        let cli = parse(&[
            "ipc-server", "-q", "/var/tmp", "-n", "5", "/bin/cat", "-q", "--shell", "-V",
        ]);
        assert_eq!(cli.queue, PathBuf::from("/var/tmp"));
        assert_eq!(cli.nice, 5);
        assert!(!cli.shell);
        assert_eq!(
            child_args(&cli),
            vec![OsString::from("-q"), OsString::from("--shell"), OsString::from("-V")]
        );
    }

    #[test]
    fn shell_mode_joins_the_command_line() {
        let cli = parse(&["ipc-server", "--shell", "echo", "-n", "hi"]);
        let command = cli.child_command().unwrap();
        assert_eq!(command.program(), Path::new("/bin/sh"));
        assert_eq!(
            command.get_args(),
            &[OsString::from("-c"), OsString::from("echo -n hi")]
        );
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["ipc-server", "-n", "3"]).is_err());
    }
}
