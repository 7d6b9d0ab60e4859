use crate::gateway::TransportError;
use courier_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Sending blocked until the user re-verifies these recipients.
    /// Not retried automatically and consumes no retry budget.
    #[error("message {message_id} blocked: {} untrusted recipient(s)", recipients.len())]
    UntrustedRecipients {
        message_id: String,
        recipients: Vec<String>,
    },
}
