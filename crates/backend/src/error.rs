//! Error taxonomy for host-side device operations.

use crate::handle::SessionId;
use std::fmt;

/// Lifecycle state of a [`DeviceSession`](crate::session::DeviceSession).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opened,
    ProgramLoaded,
    /// A stage failed after open; only `close` is accepted from here.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Closed => write!(f, "closed"),
            SessionState::Opened => write!(f, "opened"),
            SessionState::ProgramLoaded => write!(f, "program-loaded"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Failure of a device-session stage.
///
/// Each variant names the stage that failed. None of them is retried
/// automatically; retrying is a caller policy on a fresh session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("program load failed: {0}")]
    ProgramLoadFailed(String),
    #[error("out of device memory: {requested} bytes requested ({reason})")]
    OutOfDeviceMemory { requested: usize, reason: String },
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    #[error("size mismatch: destination holds {destination} bytes, source holds {source_len}")]
    SizeMismatch { destination: usize, source_len: usize },
    #[error("enqueue failed: {0}")]
    EnqueueFailed(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("session close failed: {0}")]
    SessionCloseFailed(String),
    #[error("buffer belongs to session {owner}, not session {session}")]
    ForeignBuffer { owner: SessionId, session: SessionId },
    #[error("`{operation}` is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

impl DeviceError {
    /// Short stable name of the error class, used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::DeviceUnavailable(_) => "device-unavailable",
            DeviceError::ProgramLoadFailed(_) => "program-load-failed",
            DeviceError::OutOfDeviceMemory { .. } => "out-of-device-memory",
            DeviceError::TransferFailed(_) => "transfer-failed",
            DeviceError::SizeMismatch { .. } => "size-mismatch",
            DeviceError::EnqueueFailed(_) => "enqueue-failed",
            DeviceError::ExecutionFailed(_) => "execution-failed",
            DeviceError::SessionCloseFailed(_) => "session-close-failed",
            DeviceError::ForeignBuffer { .. } => "foreign-buffer",
            DeviceError::InvalidState { .. } => "invalid-state",
        }
    }
}

/// Renders a backend failure with its full context chain.
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
