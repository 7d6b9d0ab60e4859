use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A durable cross-device instruction, as persisted in the sync-task
/// queue. `payload` stays opaque until validated against the schema
/// selected by `task_type`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SyncTaskRecord {
    /// Monotonic insertion order; the processor's resume cursor.
    pub row_id: i64,
    pub id: String,
    pub task_type: String,
    pub payload: JsonValue,
    /// Originating envelope, for tracing across retries.
    pub envelope_id: String,
    /// Sender-declared timestamp.
    pub sent_at: i64,
    pub attempts: u32,
    pub created_at: i64,
}

impl SyncTaskRecord {
    /// Short identifier used in log lines, mirroring what arrives in
    /// every retry of the same task.
    pub fn log_id(&self) -> String {
        format!("type={},envelopeId={}", self.task_type, self.envelope_id)
    }
}

/// Addresses a message by its sender and logical send timestamp.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageAddress {
    pub sender: String,
    pub sent_at: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Delivery,
    Read,
    View,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeleteMessagePayload {
    pub conversation_id: String,
    pub message: MessageAddress,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeleteConversationPayload {
    pub conversation_id: String,
    /// Guard against deleting messages that arrived after the sender
    /// issued the delete.
    #[serde(default)]
    pub most_recent_messages: Vec<MessageAddress>,
    #[serde(default)]
    pub most_recent_non_expiring_messages: Vec<MessageAddress>,
    #[serde(default)]
    pub is_full_delete: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeleteLocalConversationPayload {
    pub conversation_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeleteAttachmentPayload {
    pub conversation_id: String,
    pub message: MessageAddress,
    pub attachment_id: String,
}

/// Shared by the `Delivery`, `Read` and `View` declared types; the
/// kind comes from the declared type, not the payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReceiptPayload {
    /// The recipient whose device emitted the receipt.
    pub sender: String,
    /// `sent_at` of the outgoing message being receipted.
    pub message_sent_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReadSyncPayload {
    pub sender: String,
    pub message_sent_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ViewSyncPayload {
    pub sender: String,
    pub message_sent_at: i64,
}

/// A validated sync task — one variant per declared type. The
/// dispatcher is an exhaustive match over this enum.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncTaskPayload {
    DeleteMessage(DeleteMessagePayload),
    DeleteConversation(DeleteConversationPayload),
    DeleteLocalConversation(DeleteLocalConversationPayload),
    DeleteSingleAttachment(DeleteAttachmentPayload),
    Receipt { kind: ReceiptKind, receipt: ReceiptPayload },
    ReadSync(ReadSyncPayload),
    ViewSync(ViewSyncPayload),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncTaskParseError {
    #[error("unknown sync task type '{task_type}'")]
    UnknownType { task_type: String },

    #[error("invalid payload for sync task type '{task_type}': {source}")]
    InvalidPayload {
        task_type: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SyncTaskPayload {
    /// Validates `payload` against the schema registered for the
    /// declared `task_type`. A failure here is permanent: malformed
    /// data cannot self-correct, so the caller discards the task.
    pub fn parse(task_type: &str, payload: &JsonValue) -> Result<Self, SyncTaskParseError> {
        fn typed<T: serde::de::DeserializeOwned>(
            task_type: &str,
            payload: &JsonValue,
        ) -> Result<T, SyncTaskParseError> {
            serde_json::from_value(payload.clone()).map_err(|source| {
                SyncTaskParseError::InvalidPayload { task_type: task_type.to_string(), source }
            })
        }

        match task_type {
            "delete-message" => Ok(Self::DeleteMessage(typed(task_type, payload)?)),
            "delete-conversation" => Ok(Self::DeleteConversation(typed(task_type, payload)?)),
            "delete-local-conversation" => {
                Ok(Self::DeleteLocalConversation(typed(task_type, payload)?))
            }
            "delete-single-attachment" => {
                Ok(Self::DeleteSingleAttachment(typed(task_type, payload)?))
            }
            "Delivery" => {
                Ok(Self::Receipt { kind: ReceiptKind::Delivery, receipt: typed(task_type, payload)? })
            }
            "Read" => {
                Ok(Self::Receipt { kind: ReceiptKind::Read, receipt: typed(task_type, payload)? })
            }
            "View" => {
                Ok(Self::Receipt { kind: ReceiptKind::View, receipt: typed(task_type, payload)? })
            }
            "ReadSync" => Ok(Self::ReadSync(typed(task_type, payload)?)),
            "ViewSync" => Ok(Self::ViewSync(typed(task_type, payload)?)),
            other => Err(SyncTaskParseError::UnknownType { task_type: other.to_string() }),
        }
    }
}
