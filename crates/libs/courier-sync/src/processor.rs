use std::time::{SystemTime, UNIX_EPOCH};

use courier_core::{SyncTaskPayload, SyncTaskRecord};
use courier_send::ConversationQueues;
use courier_storage::{lock_store, Result, SharedStore};

const BATCH_LIMIT: usize = 100;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Drains the durable sync-task queue strictly in insertion order.
///
/// One batch at a time, one task at a time inside the batch. A task
/// whose handler fails is error-logged and left queued (its attempt
/// counter bumped for diagnostics); it never aborts the rest of the
/// drain. A task whose payload fails validation is discarded.
pub struct SyncTaskProcessor {
    store: SharedStore,
    queues: ConversationQueues,
}

impl SyncTaskProcessor {
    pub fn new(store: SharedStore, queues: ConversationQueues) -> Self {
        Self { store, queues }
    }

    /// Processes queued tasks until a fetch comes back empty, yielding
    /// to the runtime between batches.
    pub async fn run_all(&self) -> Result<()> {
        let mut cursor = None;
        loop {
            let (batch, next_cursor) =
                lock_store(&self.store).dequeue_oldest_sync_tasks(cursor, BATCH_LIMIT)?;
            if batch.is_empty() {
                log::info!("syncTasks: queue drained");
                return Ok(());
            }
            log::info!("syncTasks: processing batch of {} task(s)", batch.len());
            for task in &batch {
                self.process_task(task).await;
            }
            cursor = next_cursor;
            tokio::task::yield_now().await;
        }
    }

    async fn process_task(&self, task: &SyncTaskRecord) {
        let payload = match SyncTaskPayload::parse(&task.task_type, &task.payload) {
            Ok(payload) => payload,
            Err(err) => {
                // Malformed data cannot self-correct; drop the task.
                log::error!("syncTasks: task {} failed validation, dropping it: {err}", task.log_id());
                self.remove_task(task);
                return;
            }
        };

        let outcome = self.dispatch(payload).await;
        self.settle_task(task, outcome);
    }

    /// Applies a dispatch outcome: handled tasks leave the queue,
    /// deferred ones stay with their attempt counter bumped.
    fn settle_task(&self, task: &SyncTaskRecord, outcome: Result<bool>) {
        match outcome {
            Ok(true) => self.remove_task(task),
            Ok(false) => {
                log::warn!("syncTasks: task {} not handled yet, leaving it queued", task.log_id());
                self.defer_task(task);
            }
            Err(err) => {
                log::error!("syncTasks: task {} failed (attempt {}): {err}", task.log_id(), task.attempts + 1);
                self.defer_task(task);
            }
        }
    }

    fn defer_task(&self, task: &SyncTaskRecord) {
        if let Err(err) = lock_store(&self.store).increment_sync_task_attempts(&task.id) {
            log::error!("syncTasks: failed to record attempt for task {}: {err}", task.log_id());
        }
    }

    async fn dispatch(&self, payload: SyncTaskPayload) -> Result<bool> {
        match payload {
            SyncTaskPayload::DeleteMessage(data) => {
                crate::handlers::delete_message(&self.store, &self.queues, &data).await
            }
            SyncTaskPayload::DeleteConversation(data) => {
                crate::handlers::delete_conversation(&self.store, &self.queues, &data, now_ms())
                    .await
            }
            SyncTaskPayload::DeleteLocalConversation(data) => {
                crate::handlers::delete_local_conversation(
                    &self.store,
                    &self.queues,
                    &data,
                    now_ms(),
                )
                .await
            }
            SyncTaskPayload::DeleteSingleAttachment(data) => {
                crate::handlers::delete_single_attachment(&self.store, &self.queues, &data).await
            }
            SyncTaskPayload::Receipt { kind, receipt } => {
                crate::handlers::apply_receipt(&self.store, kind, &receipt, now_ms())
            }
            SyncTaskPayload::ReadSync(data) => crate::handlers::apply_read_sync(&self.store, &data),
            SyncTaskPayload::ViewSync(data) => crate::handlers::apply_view_sync(&self.store, &data),
        }
    }

    fn remove_task(&self, task: &SyncTaskRecord) {
        if let Err(err) = lock_store(&self.store).remove_sync_task_by_id(&task.id) {
            log::error!("syncTasks: failed to remove task {}: {err}", task.log_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use courier_storage::{Conversation, InboundMessage, NewSyncTask, ReadStatus, Store};

    fn shared_store() -> SharedStore {
        Store::in_memory().expect("in-memory store").into_shared()
    }

    fn inbound(id: &str, conversation_id: &str, sender: &str, sent_at: i64) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender: sender.to_string(),
            sent_at,
            body: "hello".to_string(),
            read_status: ReadStatus::Unread,
            attachment_id: None,
        }
    }

    fn task(id: &str, task_type: &str, payload: serde_json::Value) -> NewSyncTask {
        NewSyncTask {
            id: id.to_string(),
            task_type: task_type.to_string(),
            payload,
            envelope_id: format!("env-{id}"),
            sent_at: 100,
            created_at: 100,
        }
    }

    fn delete_message_task(id: &str, conversation_id: &str, sender: &str, sent_at: i64) -> NewSyncTask {
        task(
            id,
            "delete-message",
            json!({
                "conversation_id": conversation_id,
                "message": { "sender": sender, "sent_at": sent_at },
            }),
        )
    }

    #[tokio::test]
    async fn invalid_payload_is_dropped_without_side_effects() {
        let store = shared_store();
        {
            let guard = lock_store(&store);
            guard.upsert_conversation(&Conversation::direct("c1", "peer-a")).expect("conversation");
            guard.save_inbound(&inbound("in1", "c1", "peer-a", 42)).expect("save");
            guard
                .enqueue_sync_task(&task("t1", "delete-message", json!({ "conversation_id": 7 })))
                .expect("enqueue");
            guard.enqueue_sync_task(&task("t2", "frobnicate", json!({}))).expect("enqueue");
        }

        let processor = SyncTaskProcessor::new(store.clone(), ConversationQueues::new());
        processor.run_all().await.expect("run");

        let guard = lock_store(&store);
        assert_eq!(guard.count_sync_tasks().expect("count"), 0, "both dropped");
        assert!(guard.get_inbound("in1").expect("load").is_some(), "no handler ran");
    }

    #[tokio::test]
    async fn tasks_process_in_strict_row_order() {
        let store = shared_store();
        {
            let guard = lock_store(&store);
            for (conversation_id, message_id, sent_at) in
                [("c1", "in1", 1), ("c2", "in2", 2), ("c3", "in3", 3)]
            {
                guard
                    .upsert_conversation(&Conversation::direct(conversation_id, "peer-a"))
                    .expect("conversation");
                guard
                    .save_inbound(&inbound(message_id, conversation_id, "peer-a", sent_at))
                    .expect("save");
            }
            guard.enqueue_sync_task(&delete_message_task("t1", "c1", "peer-a", 1)).expect("enqueue");
            guard.enqueue_sync_task(&delete_message_task("t2", "c2", "peer-a", 2)).expect("enqueue");
            guard.enqueue_sync_task(&delete_message_task("t3", "c3", "peer-a", 3)).expect("enqueue");
        }

        let queues = ConversationQueues::new();
        // Hold the middle task's conversation gate to stall it.
        let gate = queues.acquire("c2").await;
        let processor = Arc::new(SyncTaskProcessor::new(store.clone(), queues));
        let run = {
            let processor = processor.clone();
            tokio::spawn(async move { processor.run_all().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let guard = lock_store(&store);
            assert!(guard.get_inbound("in1").expect("load").is_none(), "task one completed");
            assert!(guard.get_inbound("in2").expect("load").is_some(), "task two stalled");
            assert!(
                guard.get_inbound("in3").expect("load").is_some(),
                "task three must wait behind task two"
            );
        }

        drop(gate);
        run.await.expect("join").expect("run");
        let guard = lock_store(&store);
        assert!(guard.get_inbound("in2").expect("load").is_none());
        assert!(guard.get_inbound("in3").expect("load").is_none());
        assert_eq!(guard.count_sync_tasks().expect("count"), 0);
    }

    #[tokio::test]
    async fn deferred_outcomes_keep_the_task_and_bump_attempts() {
        let store = shared_store();
        lock_store(&store)
            .enqueue_sync_task(&delete_message_task("t1", "c1", "peer-a", 1))
            .expect("enqueue");
        let (batch, _) = lock_store(&store).dequeue_oldest_sync_tasks(None, 10).expect("dequeue");
        let record = batch[0].clone();

        let processor = SyncTaskProcessor::new(store.clone(), ConversationQueues::new());
        processor.settle_task(&record, Ok(false));
        processor.settle_task(
            &record,
            Err(courier_storage::StorageError::RecentlyDeleted {
                conversation_id: "c1".to_string(),
            }),
        );

        let (batch, _) = lock_store(&store).dequeue_oldest_sync_tasks(None, 10).expect("dequeue");
        assert_eq!(batch.len(), 1, "deferred task stays queued");
        assert_eq!(batch[0].attempts, 2, "both deferrals are recorded");
    }

    #[tokio::test]
    async fn blocked_conversation_delete_then_recreation_is_rejected() {
        let store = shared_store();
        {
            let guard = lock_store(&store);
            let mut conversation = Conversation::direct("c1", "peer-a");
            conversation.blocked = true;
            guard.upsert_conversation(&conversation).expect("conversation");
            guard.save_inbound(&inbound("in1", "c1", "peer-a", 1)).expect("save");
            guard
                .enqueue_sync_task(&task(
                    "t1",
                    "delete-conversation",
                    json!({ "conversation_id": "c1" }),
                ))
                .expect("enqueue");
        }

        let processor = SyncTaskProcessor::new(store.clone(), ConversationQueues::new());
        processor.run_all().await.expect("run");

        let guard = lock_store(&store);
        assert_eq!(guard.count_messages("c1").expect("count"), 0);
        assert!(guard.get_conversation("c1").expect("load").expect("row").permanently_deleted);
        assert_eq!(guard.count_sync_tasks().expect("count"), 0);
        let err = guard
            .create_conversation(&Conversation::direct("c1", "peer-a"), now_ms())
            .expect_err("recreation must be suppressed");
        assert!(matches!(err, courier_storage::StorageError::RecentlyDeleted { .. }));
    }

    #[tokio::test]
    async fn redelivered_task_for_deleted_conversation_is_a_no_op() {
        let store = shared_store();
        {
            let guard = lock_store(&store);
            let mut conversation = Conversation::direct("c1", "peer-a");
            conversation.blocked = true;
            guard.upsert_conversation(&conversation).expect("conversation");
            guard
                .enqueue_sync_task(&task(
                    "t1",
                    "delete-conversation",
                    json!({ "conversation_id": "c1" }),
                ))
                .expect("enqueue");
        }

        let processor = SyncTaskProcessor::new(store.clone(), ConversationQueues::new());
        processor.run_all().await.expect("first drain");

        // The same instruction arrives again under a fresh task id.
        lock_store(&store)
            .enqueue_sync_task(&task(
                "t1-redelivered",
                "delete-conversation",
                json!({ "conversation_id": "c1" }),
            ))
            .expect("enqueue");
        processor.run_all().await.expect("second drain");

        let guard = lock_store(&store);
        assert_eq!(guard.count_sync_tasks().expect("count"), 0);
        assert!(guard.get_conversation("c1").expect("load").expect("row").permanently_deleted);
    }

    #[tokio::test]
    async fn receipts_flow_through_the_queue() {
        let store = shared_store();
        {
            let guard = lock_store(&store);
            let mut message = courier_core::OutgoingMessage::new("m1", "c1", 1_000, "hi");
            message.apply_send_action("peer-a", courier_core::SendAction::MarkSent, 5);
            guard.save_message(&message).expect("save");
            let receipt = json!({ "sender": "peer-a", "message_sent_at": 1000 });
            guard.enqueue_sync_task(&task("t1", "Delivery", receipt.clone())).expect("enqueue");
            guard.enqueue_sync_task(&task("t2", "Read", receipt)).expect("enqueue");
        }

        let processor = SyncTaskProcessor::new(store.clone(), ConversationQueues::new());
        processor.run_all().await.expect("run");

        let guard = lock_store(&store);
        let message = guard.get_message("m1").expect("load").expect("exists");
        assert_eq!(message.send_status("peer-a"), Some(courier_core::SendStatus::Read));
        assert_eq!(guard.count_sync_tasks().expect("count"), 0);
    }
}
