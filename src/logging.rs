//! Logging setup: console output plus optional daily log files.
//!
//! With file logging enabled, two files roll over daily in the log directory:
//! - `server_system.log.YYYY-MM-DD`: every event except spoken messages
//! - `server_messages.log.YYYY-MM-DD`: only events with [`MESSAGE_LOG_TARGET`]
//!
//! Both go through `tracing-appender`'s non-blocking writer. Its worker thread
//! is flushed and joined when the [`LoggingGuard`] is dropped.

use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::{filter_fn, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Target for accepted-message events, routed to the messages file.
pub const MESSAGE_LOG_TARGET: &str = "tts_server::messages";

pub struct LoggingOptions {
    pub verbose: bool,
    pub console: bool,
    /// Directory for daily files; `None` disables file logging.
    pub file_dir: Option<PathBuf>,
}

/// Keeps the file writers alive. Drop it to flush and stop the writer thread.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
    log_dir: Option<PathBuf>,
}

impl LoggingGuard {
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

pub fn init(options: &LoggingOptions) -> Result<LoggingGuard, std::io::Error> {
    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if options.verbose {
            EnvFilter::new("debug,symphonia=info,hyper=info")
        } else {
            EnvFilter::new("info")
        }
    });

    let mut layers = Vec::new();
    let mut guards = Vec::new();

    if options.console {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(console_filter)
                .boxed(),
        );
    }

    if let Some(dir) = &options.file_dir {
        std::fs::create_dir_all(dir)?;

        let (system_writer, system_guard) =
            tracing_appender::non_blocking(rolling::daily(dir, "server_system.log"));
        guards.push(system_guard);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(system_writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter_fn(|meta| {
                    meta.target() != MESSAGE_LOG_TARGET && *meta.level() <= Level::INFO
                }))
                .boxed(),
        );

        let (message_writer, message_guard) =
            tracing_appender::non_blocking(rolling::daily(dir, "server_messages.log"));
        guards.push(message_guard);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(message_writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(Targets::new().with_target(MESSAGE_LOG_TARGET, Level::INFO))
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).init();

    Ok(LoggingGuard {
        _file_guards: guards,
        log_dir: options.file_dir.clone(),
    })
}
