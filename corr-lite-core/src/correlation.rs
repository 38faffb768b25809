use crate::clock::EngineClock;
use crate::config::CorrelationConfig;
use crate::events::{CorrelationEvent, EventLog};
use crate::gateway::{RemoteCommand, SubscriptionGateway};
use crate::keys::{self, KeyGenerator};
use crate::message_state::MessageState;
use crate::subscription_state::{MessageSubscriptionState, StartEventSubscriptionState};
use crate::types::*;
use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Command processor for the correlation-key side of the protocol. Owns the
/// message store, the message-subscription store and the start-event state
/// of one partition; applies commands strictly sequentially.
pub struct CorrelationProcessor {
    partition: PartitionId,
    config: CorrelationConfig,
    pub(crate) messages: MessageState,
    pub(crate) subscriptions: MessageSubscriptionState,
    pub(crate) start_events: StartEventSubscriptionState,
    keys: Arc<KeyGenerator>,
    clock: Arc<dyn EngineClock>,
    log: Arc<dyn EventLog>,
    gateway: Arc<dyn SubscriptionGateway>,
}

impl CorrelationProcessor {
    pub fn new(
        partition: PartitionId,
        config: CorrelationConfig,
        keys: Arc<KeyGenerator>,
        clock: Arc<dyn EngineClock>,
        log: Arc<dyn EventLog>,
        gateway: Arc<dyn SubscriptionGateway>,
    ) -> Self {
        Self {
            partition,
            config,
            messages: MessageState::new(),
            subscriptions: MessageSubscriptionState::new(),
            start_events: StartEventSubscriptionState::new(),
            keys,
            clock,
            log,
            gateway,
        }
    }

    /// Number of live (buffered or in-flight) messages on this partition.
    pub fn live_message_count(&self) -> usize {
        self.messages.len()
    }

    /// Number of open message subscriptions on this partition.
    pub fn open_subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ── Publish ──

    /// Store a published message and match it against at most one waiting
    /// subscription (oldest idle first). Unmatched messages stay buffered
    /// until expiry.
    pub async fn on_publish(&mut self, publish: PublishMessage) -> Result<CommandOutcome> {
        if self.messages.has_live_id(&publish.name, &publish.message_id) {
            return Ok(CommandOutcome::Rejected(Rejection::AlreadyExists(format!(
                "message with id '{}' is already published for name '{}'",
                publish.message_id, publish.name
            ))));
        }

        let now = self.clock.now_ms();
        let message_key = self.keys.next_key();
        let record = MessageRecord {
            message_key,
            name: publish.name.clone(),
            correlation_key: publish.correlation_key.clone(),
            message_id: publish.message_id.clone(),
            variables: publish.variables.clone(),
            deadline_ms: now + publish.ttl_ms,
        };
        debug!(
            partition = self.partition,
            message_key,
            name = %record.name,
            correlation_key = %record.correlation_key,
            "message published"
        );
        self.log
            .append(
                self.partition,
                &CorrelationEvent::MessagePublished {
                    message_key,
                    name: record.name.clone(),
                    correlation_key: record.correlation_key.clone(),
                    message_id: record.message_id.clone(),
                    deadline_ms: record.deadline_ms,
                },
            )
            .await?;
        self.messages.put(record);

        // ttl <= 0 means the deadline already passed; the message is stored
        // and will be reclaimed by the next expiry sweep, but never matches.
        self.try_match_message(message_key).await?;

        Ok(CommandOutcome::Accepted { key: message_key })
    }

    // ── Subscription lifecycle ──

    /// Create a subscription for a waiting element; immediately correlates a
    /// buffered message if one already satisfies it. The confirm back to the
    /// instance partition is sent on the duplicate path too, so a re-sent
    /// open always settles the mirror.
    pub async fn on_open_subscription(&mut self, open: OpenSubscription) -> Result<CommandOutcome> {
        let confirm = RemoteCommand::OpenMessageSubscriptionConfirmed {
            element_instance_key: open.element_instance_key,
            message_name: open.message_name.clone(),
        };
        let confirm_target = keys::partition_of(open.element_instance_key);
        if self.subscriptions.exists(&open) {
            self.gateway.send(confirm_target, confirm).await?;
            return Ok(CommandOutcome::Rejected(Rejection::InvalidState(format!(
                "subscription for element {} and message '{}' is already open",
                open.element_instance_key, open.message_name
            ))));
        }

        let subscription_key = self.keys.next_key();
        let record = MessageSubscriptionRecord {
            subscription_key,
            process_instance_key: open.process_instance_key,
            element_instance_key: open.element_instance_key,
            message_name: open.message_name.clone(),
            correlation_key: open.correlation_key.clone(),
            interrupting: open.interrupting,
            correlating: None,
            excluded_messages: BTreeSet::new(),
        };
        self.log
            .append(
                self.partition,
                &CorrelationEvent::SubscriptionCreated {
                    subscription_key,
                    process_instance_key: open.process_instance_key,
                    element_instance_key: open.element_instance_key,
                    name: open.message_name.clone(),
                    correlation_key: open.correlation_key.clone(),
                    interrupting: open.interrupting,
                },
            )
            .await?;
        self.subscriptions.put(record);
        self.gateway.send(confirm_target, confirm).await?;

        self.try_match_subscription(subscription_key).await?;
        Ok(CommandOutcome::Accepted {
            key: subscription_key,
        })
    }

    /// Acknowledgement from the instance partition: the message was applied.
    /// Interrupting subscriptions are consumed; non-interrupting ones return
    /// to idle and may immediately correlate the next buffered message.
    pub async fn on_correlate_acked(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
        message_key: Key,
    ) -> Result<CommandOutcome> {
        let Some(subscription_key) = self
            .subscriptions
            .key_for_element(element_instance_key, message_name)
        else {
            return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                "no subscription for element {element_instance_key} and message '{message_name}'"
            ))));
        };
        let in_flight = self
            .subscriptions
            .get(subscription_key)
            .and_then(|s| s.correlating.as_ref())
            .map(|i| i.message_key);
        if in_flight != Some(message_key) {
            // Duplicate or stale ack from an earlier retry round.
            return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                "subscription {subscription_key} has no in-flight message {message_key}"
            ))));
        }

        self.subscriptions.clear_correlating(subscription_key);
        // Full consumption: exactly one subscription is served per publish,
        // so an acknowledged message is done. It may already be gone if the
        // expiry sweep beat the ack.
        self.messages.remove(message_key);
        self.subscriptions.prune_excluded(message_key);
        self.log
            .append(
                self.partition,
                &CorrelationEvent::SubscriptionCorrelated {
                    subscription_key,
                    message_key,
                },
            )
            .await?;

        let interrupting = self
            .subscriptions
            .get(subscription_key)
            .is_some_and(|s| s.interrupting);
        if interrupting {
            self.subscriptions.remove(subscription_key);
            self.log
                .append(
                    self.partition,
                    &CorrelationEvent::SubscriptionDeleted { subscription_key },
                )
                .await?;
        } else {
            self.try_match_subscription(subscription_key).await?;
        }
        Ok(CommandOutcome::Accepted {
            key: subscription_key,
        })
    }

    /// Rejection from the instance partition: the element was not in a
    /// correlatable state. Frees the message so a sibling subscription can
    /// win it, and returns this subscription to idle for a later, different
    /// message.
    pub async fn on_correlate_rejected(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
        message_key: Key,
    ) -> Result<CommandOutcome> {
        let Some(subscription_key) = self
            .subscriptions
            .key_for_element(element_instance_key, message_name)
        else {
            return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                "no subscription for element {element_instance_key} and message '{message_name}'"
            ))));
        };
        let in_flight = self
            .subscriptions
            .get(subscription_key)
            .and_then(|s| s.correlating.as_ref())
            .map(|i| i.message_key);
        if in_flight != Some(message_key) {
            return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                "subscription {subscription_key} has no in-flight message {message_key}"
            ))));
        }

        debug!(
            partition = self.partition,
            subscription_key, message_key, "correlation rejected, re-matching"
        );
        self.subscriptions.clear_correlating(subscription_key);
        self.subscriptions
            .exclude_message(subscription_key, message_key);
        self.messages.release(message_key);
        self.log
            .append(
                self.partition,
                &CorrelationEvent::SubscriptionRejected {
                    subscription_key,
                    message_key,
                },
            )
            .await?;

        // A different sibling may win the freed message; the rejected
        // subscription itself can match the next buffered message.
        self.try_match_message(message_key).await?;
        self.try_match_subscription(subscription_key).await?;
        Ok(CommandOutcome::Accepted {
            key: subscription_key,
        })
    }

    /// Close on scope exit. NOT_FOUND on duplicate retries is expected; the
    /// confirm is re-sent for them so the instance-side mirror always hears
    /// back, however many times the close was re-delivered.
    pub async fn on_close_subscription(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
    ) -> Result<CommandOutcome> {
        let confirm = RemoteCommand::CloseMessageSubscriptionConfirmed {
            element_instance_key,
            message_name: message_name.to_string(),
        };
        let confirm_target = keys::partition_of(element_instance_key);
        let Some(subscription_key) = self
            .subscriptions
            .key_for_element(element_instance_key, message_name)
        else {
            self.gateway.send(confirm_target, confirm).await?;
            return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                "no subscription for element {element_instance_key} and message '{message_name}'"
            ))));
        };
        let removed = self.subscriptions.remove(subscription_key);
        self.log
            .append(
                self.partition,
                &CorrelationEvent::SubscriptionDeleted { subscription_key },
            )
            .await?;
        self.gateway.send(confirm_target, confirm).await?;
        // An in-flight message goes back into the pool for other waiters.
        if let Some(in_flight) = removed.and_then(|r| r.correlating) {
            self.messages.release(in_flight.message_key);
            self.try_match_message(in_flight.message_key).await?;
        }
        Ok(CommandOutcome::Accepted {
            key: subscription_key,
        })
    }

    // ── Message start events ──

    /// Register a start-event subscription (deployment-time, on every
    /// partition). Buffered messages are matched right away.
    pub async fn on_open_start_event_subscription(
        &mut self,
        process_definition_key: Key,
        process_id: &str,
        start_event_id: &str,
        message_name: &str,
    ) -> Result<CommandOutcome> {
        if self.start_events.exists(process_definition_key, message_name) {
            return Ok(CommandOutcome::Rejected(Rejection::AlreadyExists(format!(
                "start-event subscription for definition {process_definition_key} and message '{message_name}' exists"
            ))));
        }
        let subscription_key = self.keys.next_key();
        self.start_events.put(StartEventSubscriptionRecord {
            subscription_key,
            process_definition_key,
            process_id: process_id.to_string(),
            start_event_id: start_event_id.to_string(),
            message_name: message_name.to_string(),
        });
        self.log
            .append(
                self.partition,
                &CorrelationEvent::StartEventSubscriptionCreated {
                    subscription_key,
                    process_definition_key,
                    name: message_name.to_string(),
                },
            )
            .await?;

        let now = self.clock.now_ms();
        for message_key in self.messages.matchable_for_name(message_name, now) {
            self.try_start_instance(message_key).await?;
        }
        Ok(CommandOutcome::Accepted {
            key: subscription_key,
        })
    }

    pub async fn on_close_start_event_subscription(
        &mut self,
        process_definition_key: Key,
        message_name: &str,
    ) -> Result<CommandOutcome> {
        let Some(record) = self.start_events.remove(process_definition_key, message_name) else {
            return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                "no start-event subscription for definition {process_definition_key} and message '{message_name}'"
            ))));
        };
        self.log
            .append(
                self.partition,
                &CorrelationEvent::StartEventSubscriptionDeleted {
                    process_definition_key,
                    name: message_name.to_string(),
                },
            )
            .await?;
        Ok(CommandOutcome::Accepted {
            key: record.subscription_key,
        })
    }

    /// Acknowledgement of a start-event correlation: pin the exclusivity
    /// lock to the created instance and consume the message. If the instance
    /// already reported finished while this ack was in flight, the lock is
    /// released instead of pinned, and buffered messages get a fresh chance.
    pub async fn on_start_event_acked(
        &mut self,
        process_id: &str,
        correlation_key: &str,
        message_key: Key,
        process_instance_key: Key,
    ) -> Result<CommandOutcome> {
        let matches = matches!(
            self.start_events.lock(process_id, correlation_key),
            Some(StartEventLock::Correlating { message_key: m, .. }) if *m == message_key
        );
        if !matches {
            return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                "no pending start-event correlation for '{process_id}' and key '{correlation_key}'"
            ))));
        }
        self.messages.remove(message_key);
        self.subscriptions.prune_excluded(message_key);
        if self
            .start_events
            .take_finished_before_ack(process_instance_key)
        {
            debug!(
                partition = self.partition,
                process_instance_key, "instance finished before its start ack, releasing lock"
            );
            self.start_events.remove_lock(process_id, correlation_key);
            self.rematch_start_events(process_id, correlation_key).await?;
        } else {
            self.start_events.put_lock(
                process_id,
                correlation_key,
                StartEventLock::Active {
                    process_instance_key,
                },
            );
        }
        Ok(CommandOutcome::Accepted {
            key: process_instance_key,
        })
    }

    /// Instance completed or terminated: release the correlation-key lock;
    /// a still-buffered matching message immediately starts the next
    /// instance for the freed pair. An instance whose start ack has not
    /// landed yet is remembered so the late ack releases instead of pins.
    pub async fn on_instance_finished(&mut self, process_instance_key: Key) -> Result<CommandOutcome> {
        let Some((process_id, correlation_key)) = self
            .start_events
            .release_lock_for_instance(process_instance_key)
        else {
            self.start_events
                .mark_finished_before_ack(process_instance_key);
            return Ok(CommandOutcome::Accepted {
                key: process_instance_key,
            });
        };
        debug!(
            partition = self.partition,
            process_instance_key,
            process_id = %process_id,
            correlation_key = %correlation_key,
            "correlation-key lock released"
        );
        self.rematch_start_events(&process_id, &correlation_key).await?;
        Ok(CommandOutcome::Accepted {
            key: process_instance_key,
        })
    }

    /// Offer buffered messages to the start events of one (process id,
    /// correlation key) pair after its lock was freed.
    async fn rematch_start_events(&mut self, process_id: &str, correlation_key: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let names: Vec<String> = self
            .start_events
            .subscriptions_for_process(process_id)
            .iter()
            .map(|s| s.message_name.clone())
            .collect();
        for name in names {
            if let Some(message_key) = self
                .messages
                .first_matchable(&name, correlation_key, now, &BTreeSet::new())
                .map(|m| m.message_key)
            {
                self.try_start_instance(message_key).await?;
            }
        }
        Ok(())
    }

    // ── Expiry (internal command) ──

    /// Delete a message past its deadline, regardless of open subscriptions
    /// or in-flight correlates.
    pub async fn on_expire(&mut self, message_key: Key) -> Result<CommandOutcome> {
        let Some(record) = self.messages.remove(message_key) else {
            return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                "message {message_key} is not live"
            ))));
        };
        self.subscriptions.prune_excluded(message_key);
        self.log
            .append(
                self.partition,
                &CorrelationEvent::MessageExpired {
                    message_key,
                    name: record.name,
                },
            )
            .await?;
        Ok(CommandOutcome::Accepted { key: message_key })
    }

    // ── Sweeps (called by the scheduler) ──

    /// Expire every message whose deadline has passed. Returns the count.
    pub async fn expire_due(&mut self, now: Timestamp) -> Result<usize> {
        let due = self.messages.due_for_expiry(now);
        let count = due.len();
        for message_key in due {
            self.on_expire(message_key).await?;
        }
        Ok(count)
    }

    /// Re-send the correlate command for everything stuck correlating longer
    /// than the configured timeout. Safe under duplication: the instance
    /// side is idempotent per (element instance, message key).
    pub async fn resend_stuck(&mut self, now: Timestamp) -> Result<usize> {
        let cutoff = now - self.config.correlate_timeout_ms;
        let mut resent = 0;

        for subscription_key in self.subscriptions.stuck_since(cutoff) {
            let Some(sub) = self.subscriptions.get(subscription_key) else {
                continue;
            };
            let Some(in_flight) = &sub.correlating else {
                continue;
            };
            debug!(
                partition = self.partition,
                subscription_key,
                message_key = in_flight.message_key,
                "re-sending correlate command"
            );
            self.gateway
                .send(
                    keys::partition_of(sub.process_instance_key),
                    RemoteCommand::CorrelateProcessSubscription {
                        process_instance_key: sub.process_instance_key,
                        element_instance_key: sub.element_instance_key,
                        message_name: sub.message_name.clone(),
                        correlation_key: sub.correlation_key.clone(),
                        message_key: in_flight.message_key,
                        variables: in_flight.variables.clone(),
                    },
                )
                .await?;
            self.subscriptions.touch_sent_at(subscription_key, now);
            resent += 1;
        }

        for (process_id, correlation_key) in self.start_events.stuck_locks(cutoff) {
            let Some(StartEventLock::Correlating {
                process_definition_key,
                start_event_id,
                message_name,
                message_key,
                variables,
                sent_at: _,
            }) = self.start_events.lock(&process_id, &correlation_key).cloned()
            else {
                continue;
            };
            self.gateway
                .send(
                    self.partition,
                    RemoteCommand::CorrelateStartEvent {
                        process_definition_key,
                        process_id: process_id.clone(),
                        start_event_id: start_event_id.clone(),
                        message_name: message_name.clone(),
                        correlation_key: correlation_key.clone(),
                        message_key,
                        variables: variables.clone(),
                    },
                )
                .await?;
            if let Some(lock) = self.start_events.lock_mut(&process_id, &correlation_key) {
                *lock = StartEventLock::Correlating {
                    process_definition_key,
                    start_event_id,
                    message_name,
                    message_key,
                    variables,
                    sent_at: now,
                };
            }
            resent += 1;
        }
        Ok(resent)
    }

    // ── Matching ──

    /// Offer a live message to the oldest idle subscription that can take
    /// it; falls back to start-event subscriptions. At most one match.
    async fn try_match_message(&mut self, message_key: Key) -> Result<bool> {
        let now = self.clock.now_ms();
        let Some(message) = self.messages.get(message_key) else {
            return Ok(false);
        };
        if now >= message.deadline_ms {
            return Ok(false);
        }
        let (name, correlation_key, variables) = (
            message.name.clone(),
            message.correlation_key.clone(),
            message.variables.clone(),
        );

        let candidate = self
            .subscriptions
            .idle_subscriptions(&name, &correlation_key)
            .into_iter()
            .find(|k| {
                self.subscriptions
                    .get(*k)
                    .is_some_and(|s| !s.excluded_messages.contains(&message_key))
            });
        if let Some(subscription_key) = candidate {
            self.send_correlate(subscription_key, message_key, variables, now)
                .await?;
            return Ok(true);
        }
        self.try_start_instance(message_key).await
    }

    /// Offer the earliest buffered eligible message to one subscription
    /// (after open, ack, or rejection).
    async fn try_match_subscription(&mut self, subscription_key: Key) -> Result<bool> {
        let now = self.clock.now_ms();
        let Some(sub) = self.subscriptions.get(subscription_key) else {
            return Ok(false);
        };
        if !sub.is_idle() {
            return Ok(false);
        }
        let found = self
            .messages
            .first_matchable(
                &sub.message_name,
                &sub.correlation_key,
                now,
                &sub.excluded_messages,
            )
            .map(|m| (m.message_key, m.variables.clone()));
        if let Some((message_key, variables)) = found {
            self.send_correlate(subscription_key, message_key, variables, now)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark the pair correlating, hold the message, and fire the correlate
    /// command at the instance partition (derived from the instance key).
    async fn send_correlate(
        &mut self,
        subscription_key: Key,
        message_key: Key,
        variables: String,
        now: Timestamp,
    ) -> Result<()> {
        let Some(sub) = self.subscriptions.get(subscription_key) else {
            return Ok(());
        };
        let command = RemoteCommand::CorrelateProcessSubscription {
            process_instance_key: sub.process_instance_key,
            element_instance_key: sub.element_instance_key,
            message_name: sub.message_name.clone(),
            correlation_key: sub.correlation_key.clone(),
            message_key,
            variables: variables.clone(),
        };
        let target = keys::partition_of(sub.process_instance_key);

        self.messages.hold(message_key);
        self.subscriptions.begin_correlating(
            subscription_key,
            InFlightCorrelation {
                message_key,
                variables,
                sent_at: now,
            },
        );
        self.log
            .append(
                self.partition,
                &CorrelationEvent::SubscriptionCorrelating {
                    subscription_key,
                    message_key,
                },
            )
            .await?;
        self.gateway.send(target, command).await?;
        Ok(())
    }

    /// Offer a message to the start-event subscriptions listening on its
    /// name; takes the correlation-key lock for the winning process id.
    async fn try_start_instance(&mut self, message_key: Key) -> Result<bool> {
        let now = self.clock.now_ms();
        let Some(message) = self.messages.get(message_key) else {
            return Ok(false);
        };
        if now >= message.deadline_ms {
            return Ok(false);
        }
        let (name, correlation_key, variables) = (
            message.name.clone(),
            message.correlation_key.clone(),
            message.variables.clone(),
        );

        let candidate = self
            .start_events
            .subscriptions_for(&name)
            .into_iter()
            .find(|s| self.start_events.lock(&s.process_id, &correlation_key).is_none())
            .cloned();
        let Some(sub) = candidate else {
            return Ok(false);
        };

        self.messages.hold(message_key);
        self.start_events.put_lock(
            &sub.process_id,
            &correlation_key,
            StartEventLock::Correlating {
                process_definition_key: sub.process_definition_key,
                start_event_id: sub.start_event_id.clone(),
                message_name: name.clone(),
                message_key,
                variables: variables.clone(),
                sent_at: now,
            },
        );
        // Start-event instances are created on the publish partition, so the
        // correlate goes to this partition's own instance-side processor.
        self.gateway
            .send(
                self.partition,
                RemoteCommand::CorrelateStartEvent {
                    process_definition_key: sub.process_definition_key,
                    process_id: sub.process_id.clone(),
                    start_event_id: sub.start_event_id.clone(),
                    message_name: name,
                    correlation_key,
                    message_key,
                    variables,
                },
            )
            .await?;
        Ok(true)
    }
}

// ─────────────────────────── tests ───────────────────────────
