use thiserror::Error;

use super::models::JobId;

/// Failures reported by a transfer engine command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("destination unreachable: {0}")]
    Unreachable(String),

    /// The command arrived after the run had already been cancelled.
    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

/// Errors surfaced by the transfer dialog. None of these change dialog state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("no source has been loaded")]
    NoSource,

    #[error("select at least one database or collection")]
    NothingSelected,

    #[error("a destination must be chosen for this import")]
    MissingDestination,

    #[error("cannot {action} while {phase}")]
    InvalidTransition {
        phase: &'static str,
        action: &'static str,
    },

    #[error("override mode drops existing data; type the confirmation text first")]
    ConfirmationRequired,

    #[error("confirmation text does not match")]
    ConfirmationMismatch,

    #[error("this transfer format cannot be paused")]
    PauseUnsupported,

    #[error("another transfer ({job_id}) is already running on this connection")]
    ConnectionBusy { job_id: JobId },

    #[error("there is no failed transfer to recover")]
    NoRecoveryState,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
