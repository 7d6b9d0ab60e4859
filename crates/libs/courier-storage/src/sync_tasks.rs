use rusqlite::{params, Row};
use serde_json::Value as JsonValue;

use courier_core::SyncTaskRecord;

use crate::{Result, Store};

/// A sync task about to enter the durable queue; the store assigns the
/// monotonic row id on insert.
#[derive(Clone, Debug)]
pub struct NewSyncTask {
    pub id: String,
    pub task_type: String,
    pub payload: JsonValue,
    pub envelope_id: String,
    pub sent_at: i64,
    pub created_at: i64,
}

fn task_from_row(row: &Row) -> rusqlite::Result<SyncTaskRecord> {
    let payload_json: String = row.get(3)?;
    let attempts: i64 = row.get(6)?;
    Ok(SyncTaskRecord {
        row_id: row.get(0)?,
        id: row.get(1)?,
        task_type: row.get(2)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(JsonValue::Null),
        envelope_id: row.get(4)?,
        sent_at: row.get(5)?,
        attempts: attempts.max(0) as u32,
        created_at: row.get(7)?,
    })
}

impl Store {
    /// Appends a task to the queue and returns its row id. Row ids are
    /// strictly increasing in insertion order.
    pub fn enqueue_sync_task(&self, task: &NewSyncTask) -> Result<i64> {
        let payload = serde_json::to_string(&task.payload)?;
        self.conn().execute(
            "INSERT INTO sync_tasks (id, task_type, payload, envelope_id, sent_at, attempts, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                &task.id,
                &task.task_type,
                payload,
                &task.envelope_id,
                task.sent_at,
                task.created_at,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Fetches up to `limit` tasks strictly after `previous_row_id`
    /// (`None` = from the beginning), in ascending row order. Returns
    /// the batch and the last row id in it, the caller's next cursor.
    pub fn dequeue_oldest_sync_tasks(
        &self,
        previous_row_id: Option<i64>,
        limit: usize,
    ) -> Result<(Vec<SyncTaskRecord>, Option<i64>)> {
        let cursor = previous_row_id.unwrap_or(i64::MIN);
        let mut stmt = self.conn().prepare(
            "SELECT row_id, id, task_type, payload, envelope_id, sent_at, attempts, created_at \
             FROM sync_tasks WHERE row_id > ?1 ORDER BY row_id ASC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![cursor, limit as i64])?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(task_from_row(row)?);
        }
        let last_row_id = tasks.last().map(|task| task.row_id);
        Ok((tasks, last_row_id))
    }

    /// Removing an already-removed task is a no-op, which makes
    /// redelivery of a handled row harmless.
    pub fn remove_sync_task_by_id(&self, task_id: &str) -> Result<()> {
        self.conn().execute("DELETE FROM sync_tasks WHERE id = ?1", params![task_id])?;
        Ok(())
    }

    /// Bumps the persisted attempt counter of a deferred task; purely
    /// diagnostic, there is no in-process retry ceiling per task.
    pub fn increment_sync_task_attempts(&self, task_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE sync_tasks SET attempts = attempts + 1 WHERE id = ?1",
            params![task_id],
        )?;
        Ok(())
    }

    pub fn count_sync_tasks(&self) -> Result<u64> {
        let count: i64 =
            self.conn().query_row("SELECT COUNT(*) FROM sync_tasks", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_task(id: &str, task_type: &str) -> NewSyncTask {
        NewSyncTask {
            id: id.to_string(),
            task_type: task_type.to_string(),
            payload: json!({ "conversation_id": "c1" }),
            envelope_id: format!("env-{id}"),
            sent_at: 100,
            created_at: 100,
        }
    }

    #[test]
    fn row_ids_are_strictly_increasing() {
        let store = Store::in_memory().expect("in-memory store");
        let first = store.enqueue_sync_task(&new_task("t1", "delete-message")).expect("enqueue");
        let second = store.enqueue_sync_task(&new_task("t2", "delete-message")).expect("enqueue");
        assert!(second > first);
    }

    #[test]
    fn dequeue_respects_cursor_and_order() {
        let store = Store::in_memory().expect("in-memory store");
        for id in ["t1", "t2", "t3"] {
            store.enqueue_sync_task(&new_task(id, "delete-message")).expect("enqueue");
        }

        let (batch, last) = store.dequeue_oldest_sync_tasks(None, 2).expect("dequeue");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, "t1");
        assert_eq!(batch[1].id, "t2");

        let (rest, _) = store.dequeue_oldest_sync_tasks(last, 10).expect("dequeue rest");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "t3");

        let (empty, cursor) =
            store.dequeue_oldest_sync_tasks(Some(rest[0].row_id), 10).expect("dequeue empty");
        assert!(empty.is_empty());
        assert!(cursor.is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let store = Store::in_memory().expect("in-memory store");
        store.enqueue_sync_task(&new_task("t1", "delete-message")).expect("enqueue");
        store.remove_sync_task_by_id("t1").expect("remove");
        store.remove_sync_task_by_id("t1").expect("remove again");
        assert_eq!(store.count_sync_tasks().expect("count"), 0);
    }

    #[test]
    fn attempts_are_persisted() {
        let store = Store::in_memory().expect("in-memory store");
        store.enqueue_sync_task(&new_task("t1", "delete-message")).expect("enqueue");
        store.increment_sync_task_attempts("t1").expect("bump");
        store.increment_sync_task_attempts("t1").expect("bump");
        let (batch, _) = store.dequeue_oldest_sync_tasks(None, 10).expect("dequeue");
        assert_eq!(batch[0].attempts, 2);
    }

    #[test]
    fn open_on_disk_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("courier.db");
        {
            let store = Store::open(&path).expect("open");
            store.enqueue_sync_task(&new_task("t1", "delete-message")).expect("enqueue");
        }
        let store = Store::open(&path).expect("reopen");
        let (batch, _) = store.dequeue_oldest_sync_tasks(None, 10).expect("dequeue");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "t1");
    }
}
