use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use courier_core::OutgoingMessage;

use crate::{Result, Store};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    Unread,
    Read,
    Viewed,
}

impl ReadStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Unread => "unread",
            Self::Read => "read",
            Self::Viewed => "viewed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "read" => Self::Read,
            "viewed" => Self::Viewed,
            _ => Self::Unread,
        }
    }
}

/// A message received from a peer — the target of read/view syncs and
/// delete-message tasks.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    pub sent_at: i64,
    pub body: String,
    pub read_status: ReadStatus,
    pub attachment_id: Option<String>,
}

const OUTGOING_COLUMNS: &str = "id, conversation_id, sent_at, edited_at, body, send_state, \
     send_attempt, sent, permanently_failed, sent_to, unidentified_deliveries, send_errors, \
     attachment_id";

fn outgoing_from_row(row: &Row) -> rusqlite::Result<OutgoingMessage> {
    let send_state_json: Option<String> = row.get(5)?;
    let sent_to_json: Option<String> = row.get(9)?;
    let unidentified_json: Option<String> = row.get(10)?;
    let errors_json: Option<String> = row.get(11)?;
    let send_attempt: i64 = row.get(6)?;
    Ok(OutgoingMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sent_at: row.get(2)?,
        edited_at: row.get(3)?,
        body: row.get(4)?,
        send_state_by_conversation: send_state_json
            .as_deref()
            .and_then(|value| serde_json::from_str(value).ok())
            .unwrap_or_default(),
        send_attempt: send_attempt.max(0) as u32,
        sent: row.get(7)?,
        permanently_failed: row.get(8)?,
        sent_to: sent_to_json
            .as_deref()
            .and_then(|value| serde_json::from_str(value).ok())
            .unwrap_or_default(),
        unidentified_deliveries: unidentified_json
            .as_deref()
            .and_then(|value| serde_json::from_str(value).ok())
            .unwrap_or_default(),
        send_errors: errors_json
            .as_deref()
            .and_then(|value| serde_json::from_str(value).ok())
            .unwrap_or_default(),
        do_not_save: false,
        attachment_id: row.get(12)?,
    })
}

impl Store {
    /// Upserts an outgoing message. Transient (`do_not_save`) messages
    /// are the caller's concern; the store persists whatever it is
    /// handed.
    pub fn save_message(&self, message: &OutgoingMessage) -> Result<()> {
        let send_state = serde_json::to_string(&message.send_state_by_conversation)?;
        let sent_to = serde_json::to_string(&message.sent_to)?;
        let unidentified = serde_json::to_string(&message.unidentified_deliveries)?;
        let errors = serde_json::to_string(&message.send_errors)?;
        self.conn().execute(
            "INSERT INTO messages (id, conversation_id, direction, sent_at, edited_at, body, \
             send_state, send_attempt, sent, permanently_failed, sent_to, \
             unidentified_deliveries, send_errors, attachment_id) \
             VALUES (?1, ?2, 'out', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT(id) DO UPDATE SET \
                edited_at = excluded.edited_at, \
                body = excluded.body, \
                send_state = excluded.send_state, \
                send_attempt = excluded.send_attempt, \
                sent = excluded.sent, \
                permanently_failed = excluded.permanently_failed, \
                sent_to = excluded.sent_to, \
                unidentified_deliveries = excluded.unidentified_deliveries, \
                send_errors = excluded.send_errors, \
                attachment_id = excluded.attachment_id",
            params![
                &message.id,
                &message.conversation_id,
                message.sent_at,
                message.edited_at,
                &message.body,
                send_state,
                message.send_attempt as i64,
                message.sent,
                message.permanently_failed,
                sent_to,
                unidentified,
                errors,
                &message.attachment_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<OutgoingMessage>> {
        let query = format!(
            "SELECT {OUTGOING_COLUMNS} FROM messages WHERE id = ?1 AND direction = 'out' LIMIT 1"
        );
        let mut stmt = self.conn().prepare(&query)?;
        Ok(stmt.query_row(params![message_id], outgoing_from_row).optional()?)
    }

    /// Looks up an outgoing message by its logical send timestamp, the
    /// addressing receipts use.
    pub fn find_outgoing_by_sent_at(&self, sent_at: i64) -> Result<Option<OutgoingMessage>> {
        let query = format!(
            "SELECT {OUTGOING_COLUMNS} FROM messages \
             WHERE sent_at = ?1 AND direction = 'out' LIMIT 1"
        );
        let mut stmt = self.conn().prepare(&query)?;
        Ok(stmt.query_row(params![sent_at], outgoing_from_row).optional()?)
    }

    pub fn save_inbound(&self, message: &InboundMessage) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO messages \
             (id, conversation_id, direction, sender, sent_at, body, read_status, attachment_id) \
             VALUES (?1, ?2, 'in', ?3, ?4, ?5, ?6, ?7)",
            params![
                &message.id,
                &message.conversation_id,
                &message.sender,
                message.sent_at,
                &message.body,
                message.read_status.as_str(),
                &message.attachment_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_inbound(&self, message_id: &str) -> Result<Option<InboundMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, sender, sent_at, body, read_status, attachment_id \
             FROM messages WHERE id = ?1 AND direction = 'in' LIMIT 1",
        )?;
        stmt.query_row(params![message_id], |row| {
            let read_status: Option<String> = row.get(5)?;
            Ok(InboundMessage {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                sender: row.get(2)?,
                sent_at: row.get(3)?,
                body: row.get(4)?,
                read_status: read_status
                    .as_deref()
                    .map(ReadStatus::parse)
                    .unwrap_or(ReadStatus::Unread),
                attachment_id: row.get(6)?,
            })
        })
        .optional()
        .map_err(Into::into)
    }

    /// Resolves the id of the message addressed by `(sender, sent_at)`
    /// inside one conversation. Covers both directions.
    pub fn find_message_id_by_address(
        &self,
        conversation_id: &str,
        sender: &str,
        sent_at: i64,
    ) -> Result<Option<String>> {
        let id = self
            .conn()
            .query_row(
                "SELECT id FROM messages \
                 WHERE conversation_id = ?1 AND sent_at = ?2 \
                   AND (sender = ?3 OR (direction = 'out' AND ?3 = '')) \
                 LIMIT 1",
                params![conversation_id, sent_at, sender],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Resolves the inbound message addressed by `(sender, sent_at)`
    /// regardless of conversation — read/view syncs do not carry one.
    pub fn find_inbound_by_address(
        &self,
        sender: &str,
        sent_at: i64,
    ) -> Result<Option<InboundMessage>> {
        let id: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM messages \
                 WHERE direction = 'in' AND sender = ?1 AND sent_at = ?2 LIMIT 1",
                params![sender, sent_at],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => self.get_inbound(&id),
            None => Ok(None),
        }
    }

    /// Removing a missing message is a no-op; returns whether a row
    /// was deleted.
    pub fn remove_message(&self, message_id: &str) -> Result<bool> {
        let deleted =
            self.conn().execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
        Ok(deleted > 0)
    }

    pub fn delete_all_messages(&self, conversation_id: &str) -> Result<u64> {
        let deleted = self.conn().execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(deleted as u64)
    }

    /// Deletes messages sent at or before `cutoff`, sparing anything
    /// newer that the deletion's issuer cannot have seen yet.
    pub fn delete_messages_up_to(&self, conversation_id: &str, cutoff: i64) -> Result<u64> {
        let deleted = self.conn().execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND sent_at <= ?2",
            params![conversation_id, cutoff],
        )?;
        Ok(deleted as u64)
    }

    pub fn count_messages(&self, conversation_id: &str) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Clears the attachment reference on a message if it matches.
    /// Returns `true` if a row changed.
    pub fn clear_attachment(&self, message_id: &str, attachment_id: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE messages SET attachment_id = NULL \
             WHERE id = ?1 AND attachment_id = ?2",
            params![message_id, attachment_id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_read_status(&self, message_id: &str, status: ReadStatus) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE messages SET read_status = ?1 WHERE id = ?2 AND direction = 'in'",
            params![status.as_str(), message_id],
        )?;
        Ok(changed > 0)
    }
}
