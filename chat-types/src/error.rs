//! Error types for chatsync.

use crate::{Table, UserId};
use thiserror::Error;

/// Errors that can occur in chatsync operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Initial load or resync failed. Retryable.
    #[error("fetch failed for {table}: {reason}")]
    FetchFailed {
        /// Collection that could not be read.
        table: Table,
        /// Collaborator error message.
        reason: String,
    },

    /// Send or attachment insert failed. The pending message is flagged failed.
    #[error("mutation failed on {table}: {reason}")]
    MutationFailed {
        /// Collection that rejected the write.
        table: Table,
        /// Collaborator error message.
        reason: String,
    },

    /// Blob upload failed before any message was created.
    #[error("upload failed for {path}: {reason}")]
    UploadFailed {
        /// Storage path of the attempted upload.
        path: String,
        /// Collaborator error message.
        reason: String,
    },

    /// Change stream dropped. Triggers a resync.
    #[error("subscription lost on {table}: {reason}")]
    SubscriptionLost {
        /// Collection whose stream dropped.
        table: Table,
        /// Transport error message.
        reason: String,
    },

    /// Profile lookup returned nothing. Rendered with a placeholder.
    #[error("no profile for user {0}")]
    ResolutionGap(UserId),

    /// A collaborator record could not be decoded.
    #[error("invalid {table} record: {reason}")]
    InvalidRecord {
        /// Collection the record came from.
        table: Table,
        /// Decode error message.
        reason: String,
    },

    /// Message content was empty after trimming.
    #[error("message content is empty")]
    EmptyMessage,

    /// A chat command was issued with no live chat.
    #[error("no chat selected")]
    NoChatSelected,

    /// No session user.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The referenced message is not in the current window.
    #[error("unknown message: {0}")]
    UnknownMessage(String),
}

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Reads: surfaced as a retryable error state.
    Fetch,
    /// Writes: surfaced on the affected pending message.
    Mutation,
    /// Stream loss: handled by automatic resync.
    Subscription,
    /// Profile gaps: degrade to placeholders.
    Resolution,
    /// Bad input or wrong state for the command.
    Validation,
}

impl SyncError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::FetchFailed { .. } => ErrorKind::Fetch,
            SyncError::MutationFailed { .. } | SyncError::UploadFailed { .. } => {
                ErrorKind::Mutation
            }
            SyncError::SubscriptionLost { .. } => ErrorKind::Subscription,
            SyncError::ResolutionGap(_) => ErrorKind::Resolution,
            SyncError::InvalidRecord { .. }
            | SyncError::EmptyMessage
            | SyncError::NoChatSelected
            | SyncError::NotAuthenticated
            | SyncError::UnknownMessage(_) => ErrorKind::Validation,
        }
    }

    /// Whether repeating the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Fetch | ErrorKind::Mutation | ErrorKind::Subscription
        )
    }
}
