//! Structured logging setup.
//!
//! Console output goes to stderr so it never interleaves with command output
//! on stdout. When a log directory is given, a second layer writes JSON
//! lines to a daily rolling file there.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Environment variable holding an `EnvFilter` directive, e.g. `sysrev=debug`.
pub const ENV_LOG: &str = "SYSREV_LOG";
pub const LOG_FILE_PREFIX: &str = "sysrev.log";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    /// Emit console logs as JSON instead of human-readable lines.
    pub json: bool,
}

impl LogOptions {
    fn filter(&self) -> EnvFilter {
        let default = if self.verbose { "sysrev=debug,info" } else { "sysrev=info,warn" };
        EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(default))
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. Calling this twice is harmless: the second
/// installation is ignored.
pub fn init(options: &LogOptions, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let console = if options.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(options.filter())
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(options.filter())
            .boxed()
    };

    let mut layers = vec![console];
    let mut guard = None;
    if let Some(dir) = log_dir
        && std::fs::create_dir_all(dir).is_ok()
    {
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(options.filter())
                .boxed(),
        );
        guard = Some(file_guard);
    }

    let _ = tracing_subscriber::registry().with(layers).try_init();
    guard
}
