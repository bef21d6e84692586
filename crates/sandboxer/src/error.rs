use uuid::Uuid;

use crate::store::SandboxState;

#[derive(Debug, thiserror::Error)]
pub enum SandboxerError {
    /// The sandbox already holds a different, fully-written file set.
    /// Sandboxes are exclusively owned; this is a caller bug, not a retry case.
    #[error("sandbox {id} already materialized with different inputs")]
    Conflict { id: Uuid },

    #[error("sandbox {id} is {state}, cannot {action}")]
    InvalidState {
        id: Uuid,
        state: SandboxState,
        action: &'static str,
    },

    #[error("unknown sandbox {0}")]
    Unknown(Uuid),

    #[error("invalid input path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("protocol error: {0}")]
    Protocol(#[from] sandboxer_proto::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxerError>;
