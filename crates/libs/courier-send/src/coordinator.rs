use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use courier_core::{is_sent, OutgoingMessage, SendAction};
use courier_storage::{lock_store, Conversation, ConversationKind, SharedStore};

use crate::error::SendError;
use crate::fanout::{FanoutPolicy, RecipientFanout, RecipientOutcome};
use crate::gateway::{ContentHint, RecipientSendRequest, TransportError, TransportGateway};
use crate::queues::ConversationQueues;
use crate::retry::{RetryPolicy, RetryReceiver, RetryScheduler};

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Aggregate of one send round across all fanned-out recipients.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SendRoundResult {
    pub successful_recipients: Vec<String>,
    pub failed_recipients: Vec<(String, TransportError)>,
    /// Recipients reached entirely via unidentified delivery.
    pub unidentified_deliveries: Vec<String>,
    /// The transport signalled more callbacks for this round are
    /// forthcoming; finality is deferred.
    pub send_is_not_final: bool,
}

/// Callback collecting intermediate errors while the overall job is
/// not yet on its final attempt.
pub type SaveErrors<'a> = &'a mut (dyn FnMut(Vec<String>) + Send);

/// Orchestrates fan-out across all recipients of a message, merges
/// per-recipient outcomes into the persisted send state, and decides
/// between finality and rescheduling. All collaborators are explicit
/// constructor dependencies.
pub struct SendCoordinator {
    store: SharedStore,
    fanout: RecipientFanout,
    retry: RetryScheduler,
    queues: ConversationQueues,
}

impl SendCoordinator {
    /// Returns the coordinator and the receiver its retry loop drains.
    pub fn new(
        store: SharedStore,
        gateway: Arc<dyn TransportGateway>,
        fanout_policy: FanoutPolicy,
        retry_policy: RetryPolicy,
        queues: ConversationQueues,
    ) -> (Arc<Self>, RetryReceiver) {
        let (retry, retry_rx) = RetryScheduler::new(store.clone(), retry_policy);
        let fanout = RecipientFanout::new(gateway, fanout_policy);
        (Arc::new(Self { store, fanout, retry, queues }), retry_rx)
    }

    pub fn queues(&self) -> &ConversationQueues {
        &self.queues
    }

    /// Drains retry wakeups, re-invoking the full send pipeline for
    /// each. Runs until the scheduler side of the channel is dropped.
    pub async fn run_retry_loop(self: Arc<Self>, mut retry_rx: RetryReceiver) {
        while let Some(message_id) = retry_rx.recv().await {
            log::info!("send: retrying send for message {message_id}");
            match self.send_message(&message_id).await {
                Ok(()) => {}
                Err(SendError::UntrustedRecipients { message_id, recipients }) => {
                    // Requires explicit user re-verification; never
                    // retried automatically.
                    log::error!(
                        "send: message {message_id} blocked by {} untrusted recipient(s)",
                        recipients.len(),
                    );
                }
                Err(err @ SendError::Transport(_)) => {
                    // The failed round already armed its own retry in
                    // handle_send_result; arming another here would
                    // double-count the attempt.
                    log::error!("send: retry failed for message {message_id}: {err}");
                }
                Err(err) => {
                    log::error!("send: retry failed for message {message_id}: {err}");
                    if let Err(err) = self.retry.schedule_retry(&message_id).await {
                        log::error!("send: failed to reschedule message {message_id}: {err}");
                    }
                }
            }
        }
    }

    /// The full send pipeline for one message: resolve, compute
    /// remaining recipients, fan out, merge and persist the outcome.
    /// Runs under the conversation's job gate.
    pub async fn send_message(&self, message_id: &str) -> Result<(), SendError> {
        let Some(located) = lock_store(&self.store).get_message(message_id)? else {
            log::info!(
                "send: message {message_id} was not found, maybe because it was deleted. \
                 Giving up on sending it"
            );
            return Ok(());
        };

        let _gate = self.queues.acquire(&located.conversation_id).await;
        // Re-resolve under the gate; a delete may have slipped in.
        let Some(mut message) = lock_store(&self.store).get_message(message_id)? else {
            return Ok(());
        };
        if message.permanently_failed {
            log::info!("send: message {message_id} is permanently failed. Giving up");
            return Ok(());
        }
        let Some(conversation) = lock_store(&self.store).get_conversation(&message.conversation_id)?
        else {
            log::error!("send: conversation not found for message {message_id}");
            return Ok(());
        };
        if conversation.permanently_deleted {
            log::info!(
                "send: conversation {} is permanently deleted. Giving up on message {message_id}",
                conversation.id,
            );
            return Ok(());
        }

        let target_timestamp = message.target_timestamp();
        let remaining: Vec<String> = conversation
            .recipients
            .iter()
            .filter(|recipient| {
                message.send_status(recipient).map_or(true, |status| !is_sent(status))
            })
            .cloned()
            .collect();

        let untrusted: Vec<String> = remaining
            .iter()
            .filter(|recipient| conversation.untrusted_recipients.contains(recipient))
            .cloned()
            .collect();
        if !untrusted.is_empty() {
            log::error!(
                "send: message {message_id} sending blocked because {} recipient(s) were \
                 untrusted. Failing this attempt",
                untrusted.len(),
            );
            return Err(SendError::UntrustedRecipients {
                message_id: message_id.to_string(),
                recipients: untrusted,
            });
        }

        if remaining.is_empty() {
            log::warn!(
                "send: message {message_id} looks like it was already sent to everyone. \
                 Marking final"
            );
            if message.any_recipient_sent() {
                message.sent = true;
            }
            self.persist(&mut message)?;
            return Ok(());
        }

        let now = now_ms();
        for recipient in &remaining {
            message.apply_send_action(recipient, SendAction::Start, now);
        }
        self.persist(&mut message)?;

        let round = self.fan_out(&message, &conversation, target_timestamp, remaining).await;
        self.handle_send_result(&mut message, target_timestamp, Ok(round), None).await
    }

    async fn fan_out(
        &self,
        message: &OutgoingMessage,
        conversation: &Conversation,
        target_timestamp: i64,
        recipients: Vec<String>,
    ) -> SendRoundResult {
        let group_revision = match conversation.kind {
            ConversationKind::Group => conversation.group_revision,
            ConversationKind::Direct => None,
        };
        let mut round = SendRoundResult::default();
        for recipient in recipients {
            let devices = match self.fanout.gateway().registered_devices(&recipient).await {
                Ok(devices) => devices,
                Err(error) => {
                    round.failed_recipients.push((recipient, error));
                    continue;
                }
            };
            let request = RecipientSendRequest {
                message_id: message.id.clone(),
                recipient: recipient.clone(),
                device_ids: devices,
                body: message.body.clone(),
                timestamp: target_timestamp,
                urgent: true,
                content_hint: ContentHint::Resendable,
                group_revision,
            };
            match self.fanout.send(request).await {
                RecipientOutcome::Sent(outcome) => {
                    if !outcome.unidentified_devices.is_empty() {
                        round.unidentified_deliveries.push(recipient.clone());
                    }
                    round.send_is_not_final |= outcome.send_is_not_final;
                    round.successful_recipients.push(recipient);
                }
                RecipientOutcome::Failed { error } => {
                    round.failed_recipients.push((recipient, error));
                }
            }
        }
        round
    }

    /// Produces the next persisted state from one send round's result
    /// (or thrown failure) for a specific target timestamp, then
    /// decides between finality and rescheduling.
    pub async fn handle_send_result(
        &self,
        message: &mut OutgoingMessage,
        target_timestamp: i64,
        result: Result<SendRoundResult, TransportError>,
        mut save_errors: Option<SaveErrors<'_>>,
    ) -> Result<(), SendError> {
        let message_id = message.id.clone();
        if lock_store(&self.store).get_conversation(&message.conversation_id)?.is_none() {
            log::error!("send: conversation not found for message {message_id}");
            return Ok(());
        }

        let now = now_ms();
        let mut send_is_final = true;
        match &result {
            Ok(round) => {
                log::info!(
                    "send: round for message {message_id} resolved: {} sent, {} failed",
                    round.successful_recipients.len(),
                    round.failed_recipients.len(),
                );
                send_is_final = !round.send_is_not_final;

                for recipient in &round.successful_recipients {
                    message.apply_send_action(recipient, SendAction::MarkSent, now);
                    if !message.sent_to.contains(recipient) {
                        message.sent_to.push(recipient.clone());
                    }
                }
                for (recipient, _error) in &round.failed_recipients {
                    message.apply_send_action(recipient, SendAction::MarkFailed, now);
                }
                message.send_errors = round
                    .failed_recipients
                    .iter()
                    .map(|(recipient, error)| format!("{recipient}: {error}"))
                    .collect();

                // A stale in-flight send for a superseded edit must not
                // overwrite newer unidentified-delivery state.
                if target_timestamp == message.target_timestamp() {
                    for recipient in &round.unidentified_deliveries {
                        if !message.unidentified_deliveries.contains(recipient) {
                            message.unidentified_deliveries.push(recipient.clone());
                        }
                    }
                }
            }
            Err(error) => {
                log::error!("send: error during send round for message {message_id}: {error}");
                let errors = vec![error.to_string()];
                if let Some(collect) = save_errors.as_mut() {
                    collect(errors.clone());
                }
                message.send_errors = errors;
            }
        }

        if send_is_final {
            message.sent = message.any_recipient_sent();
        }

        let persist_failure = match self.persist(message) {
            Ok(()) => None,
            Err(err) => {
                // Logged, not swallowed; never blocks retry scheduling.
                log::error!("send: error saving message {message_id}: {err}");
                Some(err)
            }
        };

        let mut retry_scheduled = false;
        if send_is_final {
            let needs_retry = result.is_err() || !message.unsent_recipients().is_empty();
            if needs_retry {
                if message.sent {
                    log::warn!("send: message {message_id} failed to send to some recipients");
                } else {
                    log::warn!("send: message {message_id} failed to send to any recipient");
                }
                self.retry.schedule_retry(&message_id).await?;
                retry_scheduled = true;
            } else {
                log::info!("send: message {message_id} sent successfully");
            }
        }

        match result {
            Err(error) => Err(error.into()),
            // A failed save with a retry already armed resolves on that
            // retry; only surface it when nothing else will run.
            Ok(_) => match persist_failure {
                Some(err) if !retry_scheduled => Err(err),
                _ => Ok(()),
            },
        }
    }

    fn persist(&self, message: &mut OutgoingMessage) -> Result<(), SendError> {
        if message.do_not_save {
            log::info!("send: message {} not saved due to do_not_save flag", message.id);
            return Ok(());
        }
        let _save = self.queues.begin_save(&message.conversation_id);
        lock_store(&self.store).save_message(message)?;
        Ok(())
    }
}
