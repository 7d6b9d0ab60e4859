//! Outbound delivery pipeline for the courier core.
//!
//! Three cooperating pieces, all driven by explicit dependencies:
//!
//! - [`RecipientFanout`] — one recipient, all devices, bounded
//!   exponential backoff for transient transport failures
//! - [`SendCoordinator`] — fans out across recipients, merges outcomes
//!   into the persisted send state, decides finality
//! - [`RetryScheduler`] — fixed-delay, bounded re-send of a whole
//!   message attempt, with a sticky permanently-failed terminal state
//!
//! The transport itself stays behind [`TransportGateway`]; the core
//! only depends on its per-recipient success/failure contract.

pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod queues;
pub mod retry;

pub use coordinator::{SendCoordinator, SendRoundResult};
pub use error::SendError;
pub use fanout::{FanoutPolicy, RecipientFanout, RecipientOutcome};
pub use gateway::{
    ContentHint, DeviceSendFailure, RecipientSendOutcome, RecipientSendRequest, TransportError,
    TransportGateway,
};
pub use queues::ConversationQueues;
pub use retry::{RetryPolicy, RetryReceiver, RetryScheduler};
