use std::path::PathBuf;

use thiserror::Error;

use crate::mode::InvalidModeError;

/// Errors about the engine's own setup and teardown integrity.
///
/// Failures of individual exchanges never surface here; they are absorbed
/// into the log (status-0 entries) or resolved through fallback/abort.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidMode(#[from] InvalidModeError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("setup() called again before cleanup() for {}", .path.display())]
    AlreadyActive { path: PathBuf },

    #[error(
        "exchange log {} is locked by another engine (gave up after {attempts} attempts)",
        .path.display()
    )]
    LockContended { path: PathBuf, attempts: u32 },

    #[error("lock file {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("exchange log {} cannot be used for playback: {reason}", .path.display())]
    LogUnavailable { path: PathBuf, reason: String },

    #[error("read exchange log {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse exchange log {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("write exchange log {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize exchange log: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("register interception route: {0}")]
    Route(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("{what} task failed: {message}")]
    Task { what: &'static str, message: String },
}

impl EngineError {
    pub(crate) fn task(what: &'static str, err: tokio::task::JoinError) -> Self {
        Self::Task {
            what,
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidMode(_) => "invalid_mode",
            Self::InvalidConfig(_) => "invalid_config",
            Self::AlreadyActive { .. } => "already_active",
            Self::LockContended { .. } => "lock_contended",
            Self::Lock { .. } => "lock_io",
            Self::LogUnavailable { .. } => "log_unavailable",
            Self::Read { .. } => "read",
            Self::Parse { .. } => "parse",
            Self::Write { .. } => "write",
            Self::Serialize(_) => "serialize",
            Self::Route(_) => "route",
            Self::Task { .. } => "task",
        }
    }
}
