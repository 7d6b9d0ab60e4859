//! Data model for the courier delivery core.
//!
//! This crate holds the pure, persistence-free pieces of the outbound
//! pipeline:
//!
//! - [`SendStatus`] and the [`advance`] reducer — the per-recipient
//!   send-state machine, monotonic once a recipient is sent
//! - [`OutgoingMessage`] — the persisted record mutated after every
//!   delivery attempt
//! - [`SyncTaskRecord`] and [`SyncTaskPayload`] — durable cross-device
//!   instructions, validated per declared type before dispatch

pub mod message;
pub mod send_state;
pub mod sync_task;

pub use message::OutgoingMessage;
pub use send_state::{advance, is_sent, SendAction, SendStateEntry, SendStatus};
pub use sync_task::{
    DeleteAttachmentPayload, DeleteConversationPayload, DeleteLocalConversationPayload,
    DeleteMessagePayload, MessageAddress, ReadSyncPayload, ReceiptKind, ReceiptPayload,
    SyncTaskParseError, SyncTaskPayload, SyncTaskRecord, ViewSyncPayload,
};
