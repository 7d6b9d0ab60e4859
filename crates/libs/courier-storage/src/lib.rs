//! SQLite persistence for the courier delivery core.
//!
//! One [`Store`] owns the connection and covers the three shared
//! mutable resources of the pipeline: the message table, the
//! conversation table (with the deleted-blocked suppression window)
//! and the durable sync-task queue with its monotonic row-id cursor.

mod conversations;
mod error;
mod messages;
mod sync_tasks;

pub use conversations::{Conversation, ConversationKind, BLOCKED_DELETION_WINDOW_MS};
pub use error::StorageError;
pub use messages::{InboundMessage, ReadStatus};
pub use sync_tasks::NewSyncTask;

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Handle shared by the coordinator, retry scheduler and sync-task
/// processor. All writes funnel through the one connection; the mutex
/// is only held across individual statements, never across awaits.
pub type SharedStore = Arc<Mutex<Store>>;

/// Locks a shared store, recovering the guard if a previous holder
/// panicked mid-write.
pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, Store> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                sender TEXT,
                sent_at INTEGER NOT NULL,
                edited_at INTEGER,
                body TEXT NOT NULL,
                send_state TEXT,
                send_attempt INTEGER NOT NULL DEFAULT 0,
                sent INTEGER NOT NULL DEFAULT 0,
                permanently_failed INTEGER NOT NULL DEFAULT 0,
                sent_to TEXT,
                unidentified_deliveries TEXT,
                send_errors TEXT,
                read_status TEXT,
                attachment_id TEXT
            );
            CREATE INDEX IF NOT EXISTS messages_conversation
                ON messages (conversation_id, sent_at);
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                recipients TEXT NOT NULL,
                untrusted_recipients TEXT,
                blocked INTEGER NOT NULL DEFAULT 0,
                permanently_deleted INTEGER NOT NULL DEFAULT 0,
                group_revision INTEGER
            );
            CREATE TABLE IF NOT EXISTS deleted_blocked_conversations (
                conversation_id TEXT PRIMARY KEY,
                deleted_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_tasks (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                task_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                envelope_id TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}
