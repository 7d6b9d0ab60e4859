use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::send_state::{is_sent, SendAction, SendStateEntry, SendStatus};

/// A locally authored outbound message, as persisted by the store and
/// mutated by the send coordinator after every delivery attempt.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutgoingMessage {
    pub id: String,
    pub conversation_id: String,
    /// Logical send timestamp — the immutable identity key for the
    /// send, distinct from any later edit timestamp.
    pub sent_at: i64,
    /// Timestamp of the latest edit, if the message was edited.
    pub edited_at: Option<i64>,
    pub body: String,
    /// Per target conversation (direct recipient or group member).
    #[serde(default)]
    pub send_state_by_conversation: BTreeMap<String, SendStateEntry>,
    #[serde(default)]
    pub send_attempt: u32,
    #[serde(default)]
    pub sent: bool,
    #[serde(default)]
    pub permanently_failed: bool,
    /// Recipients that acknowledged delivery at any point.
    #[serde(default)]
    pub sent_to: Vec<String>,
    #[serde(default)]
    pub unidentified_deliveries: Vec<String>,
    /// Errors from the most recent attempt.
    #[serde(default)]
    pub send_errors: Vec<String>,
    /// Transient messages are never persisted.
    #[serde(default)]
    pub do_not_save: bool,
    #[serde(default)]
    pub attachment_id: Option<String>,
}

impl OutgoingMessage {
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sent_at: i64,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sent_at,
            edited_at: None,
            body: body.into(),
            send_state_by_conversation: BTreeMap::new(),
            send_attempt: 0,
            sent: false,
            permanently_failed: false,
            sent_to: Vec::new(),
            unidentified_deliveries: Vec::new(),
            send_errors: Vec::new(),
            do_not_save: false,
            attachment_id: None,
        }
    }

    /// The timestamp an in-flight send targets: the latest edit when
    /// one exists, otherwise the original send timestamp.
    pub fn target_timestamp(&self) -> i64 {
        self.edited_at.unwrap_or(self.sent_at)
    }

    /// Folds `action` into the entry for `conversation_id`, creating a
    /// `Pending` entry first if none exists. Returns `true` if the
    /// entry's status changed.
    pub fn apply_send_action(
        &mut self,
        conversation_id: &str,
        action: SendAction,
        now: i64,
    ) -> bool {
        let entry = self
            .send_state_by_conversation
            .entry(conversation_id.to_string())
            .or_insert_with(|| SendStateEntry::new(SendStatus::Pending, now));
        entry.apply(action, now)
    }

    pub fn send_status(&self, conversation_id: &str) -> Option<SendStatus> {
        self.send_state_by_conversation.get(conversation_id).map(|entry| entry.status)
    }

    /// Recipients (conversation ids) whose entry is not yet sent.
    pub fn unsent_recipients(&self) -> Vec<String> {
        self.send_state_by_conversation
            .iter()
            .filter(|(_, entry)| !is_sent(entry.status))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// True once at least one recipient acknowledged delivery.
    pub fn any_recipient_sent(&self) -> bool {
        !self.sent_to.is_empty()
            || self.send_state_by_conversation.values().any(|entry| is_sent(entry.status))
    }

    /// Terminal state after the retry budget is exhausted with zero
    /// successful recipients. Sticky: only explicit user action outside
    /// the core may re-arm sending.
    pub fn mark_permanently_failed(&mut self) {
        self.send_state_by_conversation.clear();
        self.sent = false;
        self.permanently_failed = true;
    }
}
