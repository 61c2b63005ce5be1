// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors raised by the persistence path.
///
/// Everything on the hot path is recoverable: the caller drops the unit of
/// work it was handling, counts it and keeps serving.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("io failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("short write on {path}: wrote {written} of {expected} bytes")]
    ShortWrite {
        path: PathBuf,
        written: usize,
        expected: usize,
    },

    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("inconsistent configuration: {0}")]
    ConfigInconsistent(String),
}

impl LogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LogError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true when the failure belongs to the filesystem class.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            LogError::Io { .. } | LogError::ShortWrite { .. } | LogError::Compress(_)
        )
    }
}

/// Coded failures returned by the collection gateway.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("invalid command argument: {0}")]
    InvalidInput(String),

    #[error("too many collections in flight (limit {0})")]
    Busy(usize),

    #[error("gateway is not started")]
    NotStarted,

    #[error("gateway is already started")]
    AlreadyStarted,

    #[error("daemon is shutting down")]
    ShuttingDown,

    #[error("command failed: {0}")]
    Failed(String),
}

impl GatewayError {
    /// Status code reported back over the command channel.
    pub fn code(&self) -> i32 {
        match self {
            GatewayError::InvalidInput(_) => -1,
            GatewayError::Busy(_) => -2,
            GatewayError::NotStarted => -3,
            GatewayError::AlreadyStarted => -4,
            GatewayError::ShuttingDown => -5,
            GatewayError::Failed(_) => -6,
        }
    }
}

/// Errors raised while loading or validating the daemon configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}
