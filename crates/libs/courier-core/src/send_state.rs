use serde::{Deserialize, Serialize};

/// Per-recipient send state for one target conversation.
///
/// `Delivered`, `Read` and `Viewed` are the UI superset of terminal
/// states; the delivery core only ever produces `Sent` and `Failed`,
/// receipts advance entries beyond that.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Sending,
    Failed,
    Sent,
    Delivered,
    Read,
    Viewed,
}

/// Events the reducer folds into a [`SendStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendAction {
    /// A new overall send attempt begins for this recipient.
    Start,
    MarkSent,
    MarkFailed,
    MarkDelivered,
    MarkRead,
    MarkViewed,
}

/// Returns `true` once the recipient has acknowledged delivery in any
/// form. Entries at or beyond `Sent` never regress.
pub fn is_sent(status: SendStatus) -> bool {
    status >= SendStatus::Sent
}

/// Pure send-state reducer: `(current, action) -> next`.
///
/// Monotonic past `Sent`: a sent recipient is never downgraded to
/// `Pending`, `Sending` or `Failed`. `Failed` may re-enter `Sending`
/// only through `Start`, i.e. a new overall send attempt.
pub fn advance(current: SendStatus, action: SendAction) -> SendStatus {
    match action {
        SendAction::Start => {
            if is_sent(current) {
                current
            } else {
                SendStatus::Sending
            }
        }
        SendAction::MarkSent => current.max(SendStatus::Sent),
        SendAction::MarkFailed => {
            if is_sent(current) {
                current
            } else {
                SendStatus::Failed
            }
        }
        SendAction::MarkDelivered => current.max(SendStatus::Delivered),
        SendAction::MarkRead => current.max(SendStatus::Read),
        SendAction::MarkViewed => current.max(SendStatus::Viewed),
    }
}

/// One entry of a message's per-conversation send-state map.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendStateEntry {
    pub status: SendStatus,
    /// Epoch milliseconds of the last status change.
    pub updated_at: i64,
}

impl SendStateEntry {
    pub fn new(status: SendStatus, updated_at: i64) -> Self {
        Self { status, updated_at }
    }

    /// Applies `action`, bumping `updated_at` only on an actual status
    /// change. Returns `true` if the status changed.
    pub fn apply(&mut self, action: SendAction, now: i64) -> bool {
        let next = advance(self.status, action);
        if next == self.status {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        true
    }
}
