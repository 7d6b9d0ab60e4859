//! Durable sync-task processing.
//!
//! Cross-device instructions (deletes, receipts, read/view syncs) land
//! in a persistent queue and are drained strictly in insertion order by
//! [`SyncTaskProcessor`]. Payloads stay opaque JSON until validated
//! against the schema their declared type selects; a task that fails
//! validation is discarded, a task whose handler fails stays queued for
//! the next drain.
//!
//! Deletion handlers coordinate with the send pipeline through the
//! shared per-conversation job gates, so a structural delete never
//! races an in-flight send or save.

mod handlers;
mod processor;

pub use processor::SyncTaskProcessor;
