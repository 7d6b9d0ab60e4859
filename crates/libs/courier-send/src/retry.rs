use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use courier_storage::{lock_store, Result as StorageResult, SharedStore};

/// Bounded retry for an entire message send attempt. The delay is
/// deliberately fixed, not exponential: exponential backoff already
/// happens inside the fan-out sender per device attempt.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, delay: Duration::from_secs(5) }
    }
}

/// Wakeups delivered when a retry timer fires; the coordinator drains
/// these and re-invokes the full send pipeline.
pub type RetryReceiver = UnboundedReceiver<String>;

pub struct RetryScheduler {
    store: SharedStore,
    policy: RetryPolicy,
    retry_tx: UnboundedSender<String>,
}

impl RetryScheduler {
    pub fn new(store: SharedStore, policy: RetryPolicy) -> (Self, RetryReceiver) {
        let (retry_tx, retry_rx) = unbounded_channel();
        (Self { store, policy, retry_tx }, retry_rx)
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Schedules a delayed re-send of `message_id`, or transitions the
    /// message to the sticky permanently-failed terminal state when the
    /// attempt budget is exhausted.
    pub async fn schedule_retry(&self, message_id: &str) -> StorageResult<()> {
        let message = {
            let store = lock_store(&self.store);
            store.get_message(message_id)?
        };
        let Some(mut message) = message else {
            log::error!("retry: cannot schedule retry for {message_id}: message not found");
            return Ok(());
        };
        if message.permanently_failed {
            return Ok(());
        }

        if message.send_attempt >= self.policy.max_attempts {
            log::warn!("retry: message {message_id} has reached maximum retry attempts");
            message.mark_permanently_failed();
            lock_store(&self.store).save_message(&message)?;
            log::error!("retry: message {message_id} has been marked as permanently failed");
            return Ok(());
        }

        message.send_attempt += 1;
        lock_store(&self.store).save_message(&message)?;
        log::info!("retry: scheduling attempt {} for message {message_id}", message.send_attempt);

        let store = self.store.clone();
        let retry_tx = self.retry_tx.clone();
        let delay = self.policy.delay;
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Re-resolve by id: the message may have been deleted while
            // the timer was armed, in which case the retry is a no-op.
            let still_exists = match lock_store(&store).get_message(&message_id) {
                Ok(found) => found.is_some(),
                Err(err) => {
                    log::error!("retry: failed to re-resolve message {message_id}: {err}");
                    false
                }
            };
            if still_exists {
                let _ = retry_tx.send(message_id);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{OutgoingMessage, SendAction};
    use courier_storage::Store;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy { max_attempts: 2, delay: Duration::from_millis(5) }
    }

    #[tokio::test]
    async fn schedule_increments_attempt_and_fires_wakeup() {
        let store = Store::in_memory().expect("store").into_shared();
        lock_store(&store)
            .save_message(&OutgoingMessage::new("m1", "c1", 1_000, "hi"))
            .expect("save");
        let (scheduler, mut retry_rx) = RetryScheduler::new(store.clone(), fast_policy());

        scheduler.schedule_retry("m1").await.expect("schedule");
        let loaded = lock_store(&store).get_message("m1").expect("load").expect("exists");
        assert_eq!(loaded.send_attempt, 1);

        let woken = tokio::time::timeout(Duration::from_millis(200), retry_rx.recv())
            .await
            .expect("timer fires")
            .expect("channel open");
        assert_eq!(woken, "m1");
    }

    #[tokio::test]
    async fn exhausted_budget_marks_permanently_failed_without_timer() {
        let store = Store::in_memory().expect("store").into_shared();
        let mut message = OutgoingMessage::new("m1", "c1", 1_000, "hi");
        message.send_attempt = 2;
        message.apply_send_action("peer-a", SendAction::MarkFailed, 5);
        lock_store(&store).save_message(&message).expect("save");
        let (scheduler, mut retry_rx) = RetryScheduler::new(store.clone(), fast_policy());

        scheduler.schedule_retry("m1").await.expect("schedule");
        let loaded = lock_store(&store).get_message("m1").expect("load").expect("exists");
        assert!(loaded.permanently_failed);
        assert!(!loaded.sent);
        assert!(loaded.send_state_by_conversation.is_empty());

        let wakeup = tokio::time::timeout(Duration::from_millis(50), retry_rx.recv()).await;
        assert!(wakeup.is_err(), "no timer may be armed after permanent failure");
    }

    #[tokio::test]
    async fn permanently_failed_is_sticky() {
        let store = Store::in_memory().expect("store").into_shared();
        let mut message = OutgoingMessage::new("m1", "c1", 1_000, "hi");
        message.mark_permanently_failed();
        lock_store(&store).save_message(&message).expect("save");
        let (scheduler, mut retry_rx) = RetryScheduler::new(store.clone(), fast_policy());

        scheduler.schedule_retry("m1").await.expect("schedule");
        let loaded = lock_store(&store).get_message("m1").expect("load").expect("exists");
        assert_eq!(loaded.send_attempt, 0, "sticky terminal state consumes no attempts");
        let wakeup = tokio::time::timeout(Duration::from_millis(50), retry_rx.recv()).await;
        assert!(wakeup.is_err());
    }

    #[tokio::test]
    async fn deleted_message_makes_fired_timer_a_noop() {
        let store = Store::in_memory().expect("store").into_shared();
        lock_store(&store)
            .save_message(&OutgoingMessage::new("m1", "c1", 1_000, "hi"))
            .expect("save");
        let (scheduler, mut retry_rx) = RetryScheduler::new(store.clone(), fast_policy());

        scheduler.schedule_retry("m1").await.expect("schedule");
        lock_store(&store).remove_message("m1").expect("delete");

        let wakeup = tokio::time::timeout(Duration::from_millis(100), retry_rx.recv()).await;
        assert!(wakeup.is_err(), "deleted message must not produce a retry wakeup");
    }

    #[tokio::test]
    async fn missing_message_is_a_benign_noop() {
        let store = Store::in_memory().expect("store").into_shared();
        let (scheduler, _retry_rx) = RetryScheduler::new(store, fast_policy());
        scheduler.schedule_retry("ghost").await.expect("no-op");
    }
}
