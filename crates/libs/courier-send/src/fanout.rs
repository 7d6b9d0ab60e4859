use std::sync::Arc;
use std::time::Duration;

use crate::gateway::{
    RecipientSendOutcome, RecipientSendRequest, TransportError, TransportGateway,
};

/// Bounded backoff for one recipient's device fan-out. Four total
/// attempts: the initial call plus three retries, with the delay
/// doubling from `initial_delay` up to `max_delay`.
#[derive(Clone, Copy, Debug)]
pub struct FanoutPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for FanoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Terminal outcome of one recipient's fan-out round.
#[derive(Clone, Debug, PartialEq)]
pub enum RecipientOutcome {
    Sent(RecipientSendOutcome),
    Failed { error: TransportError },
}

/// Attempts delivery to all of a recipient's devices, retrying
/// transient transport failures in place. Performs no persistence;
/// the coordinator owns that.
pub struct RecipientFanout {
    gateway: Arc<dyn TransportGateway>,
    policy: FanoutPolicy,
}

impl RecipientFanout {
    pub fn new(gateway: Arc<dyn TransportGateway>, policy: FanoutPolicy) -> Self {
        Self { gateway, policy }
    }

    pub fn gateway(&self) -> &Arc<dyn TransportGateway> {
        &self.gateway
    }

    pub async fn send(&self, request: RecipientSendRequest) -> RecipientOutcome {
        let mut delay = self.policy.initial_delay;
        let mut attempt = 1u32;
        loop {
            match self.gateway.send_to_recipient(request.clone()).await {
                Ok(outcome) => return RecipientOutcome::Sent(outcome),
                Err(error) if error.is_retryable() && attempt < self.policy.max_attempts => {
                    log::warn!(
                        "fanout: send to {} failed, retrying ({attempt}/{}): {error}",
                        request.recipient,
                        self.policy.max_attempts - 1,
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.policy.max_delay);
                    attempt += 1;
                }
                Err(error) => {
                    log::error!(
                        "fanout: send to {} failed terminally after {attempt} attempt(s): {error}",
                        request.recipient,
                    );
                    return RecipientOutcome::Failed { error };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyGateway {
        calls: AtomicU32,
        failures_before_success: u32,
        error: TransportError,
    }

    #[async_trait]
    impl TransportGateway for FlakyGateway {
        async fn send_to_recipient(
            &self,
            _request: RecipientSendRequest,
        ) -> Result<RecipientSendOutcome, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(self.error.clone())
            } else {
                Ok(RecipientSendOutcome {
                    acknowledged_devices: vec![1],
                    ..RecipientSendOutcome::default()
                })
            }
        }

        async fn registered_devices(&self, _recipient: &str) -> Result<Vec<u32>, TransportError> {
            Ok(vec![1])
        }
    }

    fn request() -> RecipientSendRequest {
        RecipientSendRequest {
            message_id: "m1".to_string(),
            recipient: "peer-a".to_string(),
            device_ids: vec![1],
            body: "hi".to_string(),
            timestamp: 1_000,
            urgent: true,
            content_hint: Default::default(),
            group_revision: None,
        }
    }

    fn fast_policy() -> FanoutPolicy {
        FanoutPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let gateway = Arc::new(FlakyGateway {
            calls: AtomicU32::new(0),
            failures_before_success: 2,
            error: TransportError::Unreachable,
        });
        let fanout = RecipientFanout::new(gateway.clone(), fast_policy());
        let outcome = fanout.send(request()).await;
        assert!(matches!(outcome, RecipientOutcome::Sent(_)));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let gateway = Arc::new(FlakyGateway {
            calls: AtomicU32::new(0),
            failures_before_success: u32::MAX,
            error: TransportError::Timeout { recipient: "peer-a".to_string() },
        });
        let fanout = RecipientFanout::new(gateway.clone(), fast_policy());
        let outcome = fanout.send(request()).await;
        assert!(matches!(
            outcome,
            RecipientOutcome::Failed { error: TransportError::Timeout { .. } }
        ));
        // Four total attempts observed: the initial call plus three retries.
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn untrusted_identity_fails_without_retrying() {
        let gateway = Arc::new(FlakyGateway {
            calls: AtomicU32::new(0),
            failures_before_success: u32::MAX,
            error: TransportError::UntrustedIdentity { recipient: "peer-a".to_string() },
        });
        let fanout = RecipientFanout::new(gateway.clone(), fast_policy());
        let outcome = fanout.send(request()).await;
        assert!(matches!(outcome, RecipientOutcome::Failed { .. }));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }
}
