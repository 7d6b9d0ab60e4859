use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, OwnedMutexGuard};

/// Per-conversation job discipline: one structural mutation (send,
/// delete) per conversation at a time, plus a count of in-flight
/// message saves that deletion handlers wait out before touching the
/// conversation.
#[derive(Clone, Default)]
pub struct ConversationQueues {
    gates: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    saves: Arc<Mutex<HashMap<String, usize>>>,
    save_done: Arc<Notify>,
}

impl ConversationQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        gates.entry(conversation_id.to_string()).or_default().clone()
    }

    /// Serializes structural mutations for one conversation. Two
    /// independent conversations' work interleaves freely.
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        self.gate(conversation_id).lock_owned().await
    }

    /// Registers an in-flight message save; the returned guard ends it
    /// on drop.
    pub fn begin_save(&self, conversation_id: &str) -> SaveGuard {
        let mut saves = self.saves.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *saves.entry(conversation_id.to_string()).or_insert(0) += 1;
        SaveGuard { queues: self.clone(), conversation_id: conversation_id.to_string() }
    }

    fn pending_saves(&self, conversation_id: &str) -> usize {
        let saves = self.saves.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        saves.get(conversation_id).copied().unwrap_or(0)
    }

    /// Waits until every in-flight save for the conversation finished.
    pub async fn wait_for_saves(&self, conversation_id: &str) {
        loop {
            let notified = self.save_done.notified();
            if self.pending_saves(conversation_id) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct SaveGuard {
    queues: ConversationQueues,
    conversation_id: String,
}

impl Drop for SaveGuard {
    fn drop(&mut self) {
        let mut saves =
            self.queues.saves.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(count) = saves.get_mut(&self.conversation_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                saves.remove(&self.conversation_id);
            }
        }
        drop(saves);
        self.queues.save_done.notify_waiters();
    }
}
