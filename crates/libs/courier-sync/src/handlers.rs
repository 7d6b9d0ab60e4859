//! One handler per validated sync-task type.
//!
//! Handlers return `Ok(true)` when the task is done (including the
//! benign unknown-target cases), `Ok(false)` to leave it queued, and
//! `Err` for failures worth another drain. Structural deletes run
//! under the conversation's job gate and wait out in-flight saves
//! first.

use courier_core::{
    DeleteAttachmentPayload, DeleteConversationPayload, DeleteLocalConversationPayload,
    DeleteMessagePayload, ReadSyncPayload, ReceiptKind, ReceiptPayload, SendAction,
    ViewSyncPayload,
};
use courier_send::ConversationQueues;
use courier_storage::{lock_store, ReadStatus, Result, SharedStore};

pub(crate) async fn delete_message(
    store: &SharedStore,
    queues: &ConversationQueues,
    data: &DeleteMessagePayload,
) -> Result<bool> {
    let Some(conversation) = lock_store(store).get_conversation(&data.conversation_id)? else {
        log::warn!(
            "syncTasks: conversation {} not found, dropping delete-message task",
            data.conversation_id,
        );
        return Ok(true);
    };

    let _gate = queues.acquire(&conversation.id).await;
    queues.wait_for_saves(&conversation.id).await;

    let guard = lock_store(store);
    match guard.find_message_id_by_address(
        &conversation.id,
        &data.message.sender,
        data.message.sent_at,
    )? {
        Some(message_id) => {
            guard.remove_message(&message_id)?;
            log::info!("syncTasks: deleted message {message_id} in conversation {}", conversation.id);
        }
        None => {
            log::warn!(
                "syncTasks: no message at sentAt {} from {} in conversation {}, nothing to delete",
                data.message.sent_at,
                data.message.sender,
                conversation.id,
            );
        }
    }
    Ok(true)
}

pub(crate) async fn delete_conversation(
    store: &SharedStore,
    queues: &ConversationQueues,
    data: &DeleteConversationPayload,
    now: i64,
) -> Result<bool> {
    let Some(conversation) = lock_store(store).get_conversation(&data.conversation_id)? else {
        log::warn!(
            "syncTasks: conversation {} not found, dropping delete-conversation task",
            data.conversation_id,
        );
        return Ok(true);
    };
    if conversation.blocked {
        ensure_blocked_conversation_deleted(store, queues, &conversation.id, now).await?;
        return Ok(true);
    }
    if conversation.permanently_deleted {
        log::info!(
            "syncTasks: conversation {} is already permanently deleted, nothing to do",
            conversation.id,
        );
        return Ok(true);
    }

    let _gate = queues.acquire(&conversation.id).await;
    queues.wait_for_saves(&conversation.id).await;

    // The sender's most-recent-message snapshot bounds the delete;
    // anything newer arrived after the delete was issued and stays.
    let cutoff = data
        .most_recent_messages
        .iter()
        .chain(data.most_recent_non_expiring_messages.iter())
        .map(|address| address.sent_at)
        .max();

    let guard = lock_store(store);
    match cutoff {
        Some(cutoff) => {
            let deleted = guard.delete_messages_up_to(&conversation.id, cutoff)?;
            let remaining = guard.count_messages(&conversation.id)?;
            log::info!(
                "syncTasks: deleted {deleted} message(s) up to {cutoff} in conversation {}, \
                 {remaining} newer remain",
                conversation.id,
            );
            if remaining == 0 && data.is_full_delete {
                guard.remove_conversation(&conversation.id)?;
            } else if remaining > 0 && data.is_full_delete {
                log::warn!(
                    "syncTasks: conversation {} kept, newer messages arrived after the delete",
                    conversation.id,
                );
            }
        }
        None => {
            guard.delete_all_messages(&conversation.id)?;
            if data.is_full_delete {
                guard.remove_conversation(&conversation.id)?;
            }
        }
    }
    Ok(true)
}

pub(crate) async fn delete_local_conversation(
    store: &SharedStore,
    queues: &ConversationQueues,
    data: &DeleteLocalConversationPayload,
    now: i64,
) -> Result<bool> {
    let Some(conversation) = lock_store(store).get_conversation(&data.conversation_id)? else {
        log::warn!(
            "syncTasks: conversation {} not found, dropping delete-local-conversation task",
            data.conversation_id,
        );
        return Ok(true);
    };
    if conversation.blocked {
        ensure_blocked_conversation_deleted(store, queues, &conversation.id, now).await?;
        return Ok(true);
    }
    if conversation.permanently_deleted {
        return Ok(true);
    }

    let _gate = queues.acquire(&conversation.id).await;
    queues.wait_for_saves(&conversation.id).await;

    let guard = lock_store(store);
    guard.delete_all_messages(&conversation.id)?;
    guard.remove_conversation(&conversation.id)?;
    log::info!("syncTasks: locally deleted conversation {}", conversation.id);
    Ok(true)
}

/// A delete arriving for a blocked conversation always escalates to a
/// full permanent deletion: messages wiped, the row tombstoned, and a
/// suppression entry recorded so a late replay cannot recreate it.
async fn ensure_blocked_conversation_deleted(
    store: &SharedStore,
    queues: &ConversationQueues,
    conversation_id: &str,
    now: i64,
) -> Result<()> {
    log::info!(
        "syncTasks: conversation {conversation_id} is blocked, forcing permanent deletion"
    );
    let _gate = queues.acquire(conversation_id).await;
    queues.wait_for_saves(conversation_id).await;

    let guard = lock_store(store);
    guard.delete_all_messages(conversation_id)?;
    guard.mark_conversation_permanently_deleted(conversation_id)?;
    guard.record_blocked_deletion(conversation_id, now)?;
    Ok(())
}

pub(crate) async fn delete_single_attachment(
    store: &SharedStore,
    queues: &ConversationQueues,
    data: &DeleteAttachmentPayload,
) -> Result<bool> {
    let Some(conversation) = lock_store(store).get_conversation(&data.conversation_id)? else {
        log::warn!(
            "syncTasks: conversation {} not found, dropping delete-single-attachment task",
            data.conversation_id,
        );
        return Ok(true);
    };

    let _gate = queues.acquire(&conversation.id).await;
    queues.wait_for_saves(&conversation.id).await;

    let guard = lock_store(store);
    match guard.find_message_id_by_address(
        &conversation.id,
        &data.message.sender,
        data.message.sent_at,
    )? {
        Some(message_id) => {
            if !guard.clear_attachment(&message_id, &data.attachment_id)? {
                log::warn!(
                    "syncTasks: message {message_id} does not carry attachment {}, nothing to clear",
                    data.attachment_id,
                );
            }
        }
        None => {
            log::warn!(
                "syncTasks: no message at sentAt {} from {} in conversation {}, \
                 nothing to clear",
                data.message.sent_at,
                data.message.sender,
                conversation.id,
            );
        }
    }
    Ok(true)
}

/// Advances the receipted recipient's entry on the outgoing message the
/// receipt addresses. A receipt for a message we no longer have is
/// benign.
pub(crate) fn apply_receipt(
    store: &SharedStore,
    kind: ReceiptKind,
    receipt: &ReceiptPayload,
    now: i64,
) -> Result<bool> {
    let guard = lock_store(store);
    let Some(mut message) = guard.find_outgoing_by_sent_at(receipt.message_sent_at)? else {
        log::warn!(
            "syncTasks: no outgoing message at sentAt {} for {kind:?} receipt from {}",
            receipt.message_sent_at,
            receipt.sender,
        );
        return Ok(true);
    };
    let action = match kind {
        ReceiptKind::Delivery => SendAction::MarkDelivered,
        ReceiptKind::Read => SendAction::MarkRead,
        ReceiptKind::View => SendAction::MarkViewed,
    };
    message.apply_send_action(&receipt.sender, action, now);
    guard.save_message(&message)?;
    Ok(true)
}

pub(crate) fn apply_read_sync(store: &SharedStore, data: &ReadSyncPayload) -> Result<bool> {
    let guard = lock_store(store);
    let Some(message) = guard.find_inbound_by_address(&data.sender, data.message_sent_at)? else {
        log::warn!(
            "syncTasks: no inbound message at sentAt {} from {} for read sync",
            data.message_sent_at,
            data.sender,
        );
        return Ok(true);
    };
    // Viewed is the stronger state; a late read sync never downgrades.
    if message.read_status == ReadStatus::Unread {
        guard.set_read_status(&message.id, ReadStatus::Read)?;
    }
    Ok(true)
}

pub(crate) fn apply_view_sync(store: &SharedStore, data: &ViewSyncPayload) -> Result<bool> {
    let guard = lock_store(store);
    let Some(message) = guard.find_inbound_by_address(&data.sender, data.message_sent_at)? else {
        log::warn!(
            "syncTasks: no inbound message at sentAt {} from {} for view sync",
            data.message_sent_at,
            data.sender,
        );
        return Ok(true);
    };
    if message.read_status != ReadStatus::Viewed {
        guard.set_read_status(&message.id, ReadStatus::Viewed)?;
    }
    Ok(true)
}
