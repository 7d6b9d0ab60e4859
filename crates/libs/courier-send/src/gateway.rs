use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Transport errors per recipient send call.
///
/// `is_retryable()` decides whether the fan-out sender backs off and
/// tries again; everything else fails the recipient immediately.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("timeout sending to {recipient}")]
    Timeout { recipient: String },

    #[error("network unreachable")]
    Unreachable,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("identity of {recipient} is untrusted and needs re-verification")]
    UntrustedIdentity { recipient: String },

    #[error("send rejected: {reason}")]
    Rejected { reason: String },
}

impl TransportError {
    /// Returns `true` for transient failures that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unreachable | Self::RateLimited { .. }
        )
    }
}

/// Hint for how the transport should treat the content on resend.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentHint {
    #[default]
    Default,
    Resendable,
    Implicit,
}

/// One per-recipient send call: every registered device of the
/// recipient in a single transport request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipientSendRequest {
    pub message_id: String,
    pub recipient: String,
    pub device_ids: Vec<u32>,
    pub body: String,
    pub timestamp: i64,
    pub urgent: bool,
    pub content_hint: ContentHint,
    pub group_revision: Option<u64>,
}

/// The transport's structured outcome for one recipient send call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecipientSendOutcome {
    /// Devices that accepted delivery.
    pub acknowledged_devices: Vec<u32>,
    pub failed_devices: Vec<DeviceSendFailure>,
    /// Devices reached via unidentified (sealed) delivery.
    pub unidentified_devices: Vec<u32>,
    /// More callbacks for this same call are forthcoming; finality is
    /// deferred until the last one.
    pub send_is_not_final: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSendFailure {
    pub device_id: u32,
    pub error: TransportError,
}

/// The transport capability the core calls. The TLS session, sealed
/// sender and socket I/O behind it are out of scope; only this
/// success/failure contract matters here.
#[async_trait]
pub trait TransportGateway: Send + Sync {
    /// Delivers to all of `request.device_ids` in one call.
    async fn send_to_recipient(
        &self,
        request: RecipientSendRequest,
    ) -> Result<RecipientSendOutcome, TransportError>;

    /// The recipient's currently registered device identifiers.
    async fn registered_devices(&self, recipient: &str) -> Result<Vec<u32>, TransportError>;
}
