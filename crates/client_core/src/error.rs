use shared::{
    domain::EntryId,
    error::{ErrorCode, StoreError},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("remote store rejected the request: {0}")]
    RemoteRejected(String),
    #[error("entry {0} is not part of this log")]
    StaleReference(EntryId),
    #[error("entry {0} is already part of this log")]
    DuplicateEntry(EntryId),
    #[error("entry {0} is still being dragged")]
    DragInProgress(EntryId),
    #[error("rank write task ended unexpectedly: {0}")]
    WriteTask(String),
}

impl ReconcileError {
    /// Whether the same request may succeed if the caller retries it later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_) | Self::WriteTask(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_) | Self::RemoteRejected(_))
    }
}

impl From<StoreError> for ReconcileError {
    fn from(value: StoreError) -> Self {
        match value.code {
            ErrorCode::Unavailable => Self::RemoteUnavailable(value.message),
            ErrorCode::Rejected => Self::RemoteRejected(value.message),
        }
    }
}
