use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors that can stop the load balancer from starting or running. Runtime
/// failures that can be recovered from (bind, accept, backend connect) are
/// logged and retried instead of being returned as one of these.
#[derive(Debug, Error)]
pub enum Error {
    /// Generic socket error that doesn't fit anywhere else.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The config file could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    ReadConfig { path: PathBuf, source: io::Error },

    /// The config file is not valid TOML or doesn't match the schema.
    #[error("failed to parse config: {0}")]
    ParseConfig(#[from] toml::de::Error),

    /// The config file is well formed but some values are not acceptable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A listener task panicked or was cancelled.
    #[error("listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A listener cannot balance anything without backends.
    #[error("listener {0} has no usable backends")]
    NoBackends(String),
}
