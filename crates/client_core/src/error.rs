use std::{fmt, path::PathBuf};

use shared::{
    domain::{ConnectionState, MessageId},
    error::ErrorCode,
};
use thiserror::Error;

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{name}' already exists")]
    AlreadyExists { name: String },
    #[error("session '{name}' not found")]
    SessionNotFound { name: String },
    #[error("media item '{message_id}' not found")]
    MediaNotFound { message_id: MessageId },
    #[error("session '{name}' is already {state}")]
    AlreadyConnected {
        name: String,
        state: ConnectionState,
    },
    #[error("session '{name}' is not connected (state: {state})")]
    NotConnected {
        name: String,
        state: ConnectionState,
    },
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },
    #[error("corrupt media snapshot: {reason}")]
    CorruptSnapshot { reason: String },
    #[error("invalid session name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("{context}: {source}")]
    Transport {
        context: String,
        source: anyhow::Error,
    },
    #[error("{context} '{}': {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Aggregate(#[from] AggregateFailure),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::SessionNotFound { .. } | Self::MediaNotFound { .. } => ErrorCode::NotFound,
            Self::AlreadyConnected { .. } => ErrorCode::AlreadyConnected,
            Self::NotConnected { .. } => ErrorCode::NotConnected,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::CorruptSnapshot { .. } => ErrorCode::CorruptSnapshot,
            Self::InvalidName { .. } => ErrorCode::Validation,
            Self::Transport { .. } => ErrorCode::TransportFailure,
            Self::Io { .. } => ErrorCode::Internal,
            Self::Aggregate(_) => ErrorCode::AggregateFailure,
        }
    }

    pub(crate) fn transport(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

/// Every per-item failure collected by a fan-out operation.
#[derive(Debug)]
pub struct AggregateFailure {
    pub operation: &'static str,
    pub failures: Vec<(String, SessionError)>,
}

impl AggregateFailure {
    pub fn new(operation: &'static str, mut failures: Vec<(String, SessionError)>) -> Self {
        failures.sort_by(|(a, _), (b, _)| a.cmp(b));
        Self {
            operation,
            failures,
        }
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(item, _)| item.as_str())
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "encountered {} error(s) during {}",
            self.failures.len(),
            self.operation
        )?;
        for (item, err) in &self.failures {
            write!(f, "; {item}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFailure {}

/// Collapses collected failures into `Ok` or a single aggregate error.
pub(crate) fn aggregate(
    operation: &'static str,
    failures: Vec<(String, SessionError)>,
) -> SessionResult<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(AggregateFailure::new(operation, failures).into())
    }
}
