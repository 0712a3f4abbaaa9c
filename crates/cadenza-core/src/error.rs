// src/error.rs
use std::io;

/// Central error type for the cadenza engine.
///
/// Per-request failures (bad syntax, missing files, denied access) are not
/// errors here: they become status codes on the wire.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to parse configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),
    /// The worker queue is at its bound.
    #[error("worker queue is full")]
    QueueFull,
    /// The worker pool has been shut down.
    #[error("worker pool is closed")]
    PoolClosed,
}

pub type ServeResult<T> = Result<T, ServeError>;
