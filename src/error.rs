//! Error taxonomy for the server.
//!
//! Only `AlreadyRunning` and engine initialization failures affect overall
//! availability; everything else is local to one connection or message and
//! is logged where it happens.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced to `main` while bringing the server up.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A listener could not bind its port. The other protocol keeps running.
    #[error("{protocol} port {addr} unavailable: {source}")]
    PortUnavailable {
        protocol: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Instance lock failures.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live process owns the lock record.
    #[error("already running (pid {pid}, lock file {path})")]
    AlreadyRunning { pid: u32, path: String },

    #[error("lock file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Voice engine failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not be attached or configured. The dispatcher retries.
    #[error("engine initialization failed: {0}")]
    Init(String),

    /// A single render failed. The message is skipped.
    #[error("render failed: {0}")]
    Render(String),

    #[error("{kind} index {index} out of range ({available} available)")]
    NotFound {
        kind: &'static str,
        index: usize,
        available: usize,
    },

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Payload decode failures on either ingress.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("payload exceeds {limit} bytes")]
    TooLong { limit: usize },

    #[error("payload is empty after sanitizing")]
    Empty,
}

/// Rejected runtime configuration values.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("speech rate {0} outside [0, 3]")]
    RateOutOfRange(f32),

    #[error("volume {0} outside [0, 100]")]
    VolumeOutOfRange(u32),
}
