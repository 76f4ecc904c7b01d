//! Diagnostic output setup shared by both binaries.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable selecting the library's log level when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "IPC_STDIO_LOG";

fn filter_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("ipc_stdio={level},ipc_server={level},ipc_client={level}")
}

/// Install the global subscriber. Output goes to stderr so stdout stays a
/// pure data stream. A second call is a no-op.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var(LOG_LEVEL_ENV).ok();
        EnvFilter::new(filter_directive(level.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(
            filter_directive(Some("chatty")),
            "ipc_stdio=info,ipc_server=info,ipc_client=info"
        );
        assert_eq!(filter_directive(None), filter_directive(Some("info")));
    }

    #[test]
    fn warning_alias() {
        assert_eq!(filter_directive(Some("warning")), filter_directive(Some("warn")));
    }

    #[test]
    fn directives_parse() {
        for level in ["debug", "warn", "error"] {
            assert!(EnvFilter::try_new(filter_directive(Some(level))).is_ok());
        }
    }
}
