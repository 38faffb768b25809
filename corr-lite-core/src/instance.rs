use crate::clock::EngineClock;
use crate::config::CorrelationConfig;
use crate::events::{CorrelationEvent, EventLog};
use crate::gateway::{RemoteCommand, SubscriptionGateway};
use crate::process_subscription_state::ProcessSubscriptionState;
use crate::router;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Collaborator owning element execution (out of scope here). The processor
/// asks it to apply a correlated message to a live element, or to create a
/// new instance for a message start event.
#[async_trait]
pub trait ElementActivator: Send + Sync {
    /// Apply the message to the waiting element. `false` means the element
    /// is not in a correlatable state (left its scope, or a racing sibling
    /// already resolved it) — reported back as a rejection.
    async fn correlate_to_element(
        &self,
        element_instance_key: Key,
        message_name: &str,
        variables: &str,
    ) -> Result<bool>;

    /// Create a new process instance from a message start event, with the
    /// message payload as initial variables. Returns the new instance key.
    async fn create_instance(
        &self,
        partition: PartitionId,
        process_definition_key: Key,
        start_event_id: &str,
        variables: &str,
    ) -> Result<Key>;
}

/// Command processor for the instance side of the protocol. Owns the mirror
/// store of one partition.
pub struct InstanceProcessor {
    partition: PartitionId,
    config: CorrelationConfig,
    pub(crate) state: ProcessSubscriptionState,
    activator: Arc<dyn ElementActivator>,
    clock: Arc<dyn EngineClock>,
    log: Arc<dyn EventLog>,
    gateway: Arc<dyn SubscriptionGateway>,
}

impl InstanceProcessor {
    pub fn new(
        partition: PartitionId,
        config: CorrelationConfig,
        activator: Arc<dyn ElementActivator>,
        clock: Arc<dyn EngineClock>,
        log: Arc<dyn EventLog>,
        gateway: Arc<dyn SubscriptionGateway>,
    ) -> Self {
        Self {
            partition,
            config,
            state: ProcessSubscriptionState::new(),
            activator,
            clock,
            log,
            gateway,
        }
    }

    fn correlation_partition(&self, correlation_key: &str) -> PartitionId {
        router::partition_for(correlation_key, self.config.partition_count)
    }

    // ── Subscription lifecycle (driven by element activation, out of scope) ──

    /// An element started waiting: create the mirror record (in `Opening`
    /// until the correlation partition confirms) and ask the correlation
    /// partition to open the matching subscription. The open command is
    /// re-sent by the retry sweep until the confirm lands.
    pub async fn open_subscription(&mut self, open: OpenSubscription) -> Result<CommandOutcome> {
        if self.state.exists(open.element_instance_key, &open.message_name) {
            return Ok(CommandOutcome::Rejected(Rejection::InvalidState(format!(
                "mirror subscription for element {} and message '{}' is already open",
                open.element_instance_key, open.message_name
            ))));
        }
        self.state.put(ProcessMessageSubscriptionRecord {
            process_instance_key: open.process_instance_key,
            element_instance_key: open.element_instance_key,
            message_name: open.message_name.clone(),
            correlation_key: open.correlation_key.clone(),
            interrupting: open.interrupting,
            lifecycle: MirrorLifecycle::Opening {
                sent_at: self.clock.now_ms(),
            },
            correlated_messages: BTreeSet::new(),
        });
        self.log
            .append(
                self.partition,
                &CorrelationEvent::ProcessSubscriptionCreated {
                    element_instance_key: open.element_instance_key,
                    name: open.message_name.clone(),
                },
            )
            .await?;
        self.gateway
            .send(
                self.correlation_partition(&open.correlation_key),
                RemoteCommand::OpenMessageSubscription(open.clone()),
            )
            .await?;
        Ok(CommandOutcome::Accepted {
            key: open.element_instance_key,
        })
    }

    /// Scope exit: mark the mirror `Closing` and request (at-least-once)
    /// that the correlation partition closes its side too. The record stays
    /// until the confirm arrives; the retry sweep re-sends the close in the
    /// meantime. A repeated close re-sends right away.
    pub async fn close_subscription(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
    ) -> Result<CommandOutcome> {
        let now = self.clock.now_ms();
        let Some(record) = self.state.get_mut(element_instance_key, message_name) else {
            return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                "no mirror subscription for element {element_instance_key} and message '{message_name}'"
            ))));
        };
        record.lifecycle = MirrorLifecycle::Closing { sent_at: now };
        let correlation_key = record.correlation_key.clone();
        let command = RemoteCommand::CloseMessageSubscription {
            process_instance_key: record.process_instance_key,
            element_instance_key,
            message_name: message_name.to_string(),
            correlation_key: correlation_key.clone(),
        };
        let target = self.correlation_partition(&correlation_key);
        self.gateway.send(target, command).await?;
        Ok(CommandOutcome::Accepted {
            key: element_instance_key,
        })
    }

    /// The correlation partition confirmed the open: the mirror settles and
    /// the retry sweep stops re-sending. A confirm for a mirror that already
    /// moved on (closing, or gone) changes nothing.
    pub async fn on_open_confirmed(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
    ) -> Result<CommandOutcome> {
        if let Some(record) = self.state.get_mut(element_instance_key, message_name) {
            if matches!(record.lifecycle, MirrorLifecycle::Opening { .. }) {
                record.lifecycle = MirrorLifecycle::Open;
            }
        }
        Ok(CommandOutcome::Accepted {
            key: element_instance_key,
        })
    }

    /// The correlation partition confirmed the close: drop the mirror.
    /// Duplicate confirms find nothing to drop and are tolerated.
    pub async fn on_close_confirmed(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
    ) -> Result<CommandOutcome> {
        let closing = self
            .state
            .get(element_instance_key, message_name)
            .is_some_and(|r| matches!(r.lifecycle, MirrorLifecycle::Closing { .. }));
        if !closing {
            return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                "no closing mirror subscription for element {element_instance_key} and message '{message_name}'"
            ))));
        }
        self.state.remove(element_instance_key, message_name);
        self.log
            .append(
                self.partition,
                &CorrelationEvent::ProcessSubscriptionDeleted {
                    element_instance_key,
                    name: message_name.to_string(),
                },
            )
            .await?;
        Ok(CommandOutcome::Accepted {
            key: element_instance_key,
        })
    }

    // ── Retry sweep (called by the scheduler) ──

    /// Re-send the open or close command for every mirror whose request has
    /// been unconfirmed longer than the configured timeout. Both sides
    /// tolerate the duplicates this produces.
    pub async fn resend_pending(&mut self, now: Timestamp) -> Result<usize> {
        let cutoff = now - self.config.correlate_timeout_ms;
        let mut resent = 0;
        for (element_instance_key, message_name) in self.state.pending_since(cutoff) {
            let Some(record) = self.state.get_mut(element_instance_key, &message_name) else {
                continue;
            };
            let correlation_key = record.correlation_key.clone();
            let command = match &mut record.lifecycle {
                MirrorLifecycle::Opening { sent_at } => {
                    *sent_at = now;
                    RemoteCommand::OpenMessageSubscription(OpenSubscription {
                        process_instance_key: record.process_instance_key,
                        element_instance_key: record.element_instance_key,
                        message_name: record.message_name.clone(),
                        correlation_key: record.correlation_key.clone(),
                        interrupting: record.interrupting,
                    })
                }
                MirrorLifecycle::Closing { sent_at } => {
                    *sent_at = now;
                    RemoteCommand::CloseMessageSubscription {
                        process_instance_key: record.process_instance_key,
                        element_instance_key: record.element_instance_key,
                        message_name: record.message_name.clone(),
                        correlation_key: record.correlation_key.clone(),
                    }
                }
                MirrorLifecycle::Open => continue,
            };
            let target = self.correlation_partition(&correlation_key);
            debug!(
                partition = self.partition,
                element_instance_key, "re-sending unconfirmed subscription command"
            );
            self.gateway.send(target, command).await?;
            resent += 1;
        }
        Ok(resent)
    }

    // ── Correlation (remote commands from the correlation partition) ──

    /// Apply a correlate command to the live element. Idempotent per
    /// (element instance, message key): a re-delivered correlate for an
    /// already applied pair re-acks without touching the element again.
    pub async fn on_correlate(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
        correlation_key: &str,
        message_key: Key,
        variables: &str,
    ) -> Result<CommandOutcome> {
        let target = self.correlation_partition(correlation_key);

        // A correlate can only come from an open remote subscription, so it
        // doubles as an open confirm when the explicit one was lost.
        if let Some(record) = self.state.get_mut(element_instance_key, message_name) {
            if matches!(record.lifecycle, MirrorLifecycle::Opening { .. }) {
                record.lifecycle = MirrorLifecycle::Open;
            }
        }

        let already_applied = self
            .state
            .get(element_instance_key, message_name)
            // A closing mirror no longer accepts messages; the element is on
            // its way out and the race resolves as a rejection.
            .filter(|r| !matches!(r.lifecycle, MirrorLifecycle::Closing { .. }))
            .map(|r| r.correlated_messages.contains(&message_key));
        match already_applied {
            None => {
                // The element left its scope (or never existed here): the
                // expected outcome of retries and races, not an anomaly.
                debug!(
                    partition = self.partition,
                    element_instance_key, message_key, "correlate target gone, rejecting"
                );
                self.gateway
                    .send(
                        target,
                        RemoteCommand::RejectCorrelateMessageSubscription {
                            element_instance_key,
                            message_name: message_name.to_string(),
                            correlation_key: correlation_key.to_string(),
                            message_key,
                        },
                    )
                    .await?;
                Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                    "no mirror subscription for element {element_instance_key} and message '{message_name}'"
                ))))
            }
            Some(true) => {
                // Duplicate delivery (retry after a lost ack): re-ack only.
                self.gateway
                    .send(
                        target,
                        RemoteCommand::CorrelateMessageSubscription {
                            element_instance_key,
                            message_name: message_name.to_string(),
                            correlation_key: correlation_key.to_string(),
                            message_key,
                        },
                    )
                    .await?;
                Ok(CommandOutcome::Accepted {
                    key: element_instance_key,
                })
            }
            Some(false) => {
                let applied = self
                    .activator
                    .correlate_to_element(element_instance_key, message_name, variables)
                    .await?;
                if !applied {
                    self.gateway
                        .send(
                            target,
                            RemoteCommand::RejectCorrelateMessageSubscription {
                                element_instance_key,
                                message_name: message_name.to_string(),
                                correlation_key: correlation_key.to_string(),
                                message_key,
                            },
                        )
                        .await?;
                    return Ok(CommandOutcome::Rejected(Rejection::NotFound(format!(
                        "element {element_instance_key} is not in a correlatable state"
                    ))));
                }
                if let Some(record) = self.state.get_mut(element_instance_key, message_name) {
                    record.correlated_messages.insert(message_key);
                }
                self.log
                    .append(
                        self.partition,
                        &CorrelationEvent::ProcessSubscriptionCorrelated {
                            element_instance_key,
                            name: message_name.to_string(),
                            message_key,
                        },
                    )
                    .await?;
                self.gateway
                    .send(
                        target,
                        RemoteCommand::CorrelateMessageSubscription {
                            element_instance_key,
                            message_name: message_name.to_string(),
                            correlation_key: correlation_key.to_string(),
                            message_key,
                        },
                    )
                    .await?;
                Ok(CommandOutcome::Accepted {
                    key: element_instance_key,
                })
            }
        }
    }

    /// Create a new instance for a message start event. Idempotent per
    /// (process definition, message key): a re-delivered command re-acks the
    /// instance that was already created.
    #[allow(clippy::too_many_arguments)]
    pub async fn on_correlate_start_event(
        &mut self,
        process_definition_key: Key,
        process_id: &str,
        start_event_id: &str,
        message_name: &str,
        correlation_key: &str,
        message_key: Key,
        variables: &str,
    ) -> Result<CommandOutcome> {
        let target = self.correlation_partition(correlation_key);

        let process_instance_key = match self
            .state
            .start_instance_for(process_definition_key, message_key)
        {
            Some(existing) => existing,
            None => {
                let created = self
                    .activator
                    .create_instance(self.partition, process_definition_key, start_event_id, variables)
                    .await?;
                self.state
                    .record_start_instance(process_definition_key, message_key, created);
                self.log
                    .append(
                        self.partition,
                        &CorrelationEvent::StartEventSubscriptionCorrelated {
                            process_definition_key,
                            name: message_name.to_string(),
                            message_key,
                            process_instance_key: created,
                        },
                    )
                    .await?;
                debug!(
                    partition = self.partition,
                    process_definition_key, process_instance_key = created, "started instance from message"
                );
                created
            }
        };

        self.gateway
            .send(
                target,
                RemoteCommand::CorrelateStartEventAck {
                    process_id: process_id.to_string(),
                    correlation_key: correlation_key.to_string(),
                    message_key,
                    process_instance_key,
                },
            )
            .await?;
        Ok(CommandOutcome::Accepted {
            key: process_instance_key,
        })
    }
}

// ─────────────────────────── tests ───────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::MemoryLog;
    use crate::gateway::MemoryGateway;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Activator stub: counts applications, applies or refuses on demand.
    #[derive(Default)]
    struct StubActivator {
        refuse: AtomicBool,
        applied: Mutex<Vec<(Key, String)>>,
        created: AtomicU64,
    }

    #[async_trait]
    impl ElementActivator for StubActivator {
        async fn correlate_to_element(
            &self,
            element_instance_key: Key,
            message_name: &str,
            _variables: &str,
        ) -> Result<bool> {
            if self.refuse.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.applied
                .lock()
                .unwrap()
                .push((element_instance_key, message_name.to_string()));
            Ok(true)
        }

        async fn create_instance(
            &self,
            _partition: PartitionId,
            _process_definition_key: Key,
            _start_event_id: &str,
            _variables: &str,
        ) -> Result<Key> {
            Ok(500 + self.created.fetch_add(1, Ordering::SeqCst))
        }
    }

    struct Fixture {
        processor: InstanceProcessor,
        gateway: Arc<MemoryGateway>,
        activator: Arc<StubActivator>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let gateway = Arc::new(MemoryGateway::new());
        let activator = Arc::new(StubActivator::default());
        let clock = ManualClock::new(1_000);
        let processor = InstanceProcessor::new(
            0,
            CorrelationConfig::default(),
            activator.clone(),
            clock.clone(),
            Arc::new(MemoryLog::new()),
            gateway.clone(),
        );
        Fixture {
            processor,
            gateway,
            activator,
            clock,
        }
    }

    fn open(element_instance_key: Key) -> OpenSubscription {
        OpenSubscription {
            process_instance_key: element_instance_key + 1_000,
            element_instance_key,
            message_name: "order-placed".to_string(),
            correlation_key: "order-17".to_string(),
            interrupting: true,
        }
    }

    #[tokio::test]
    async fn open_mirrors_and_requests_remote_open() {
        let mut fx = fixture();
        assert!(fx
            .processor
            .open_subscription(open(100))
            .await
            .unwrap()
            .is_accepted());
        let sent = fx.gateway.drain(0);
        assert!(matches!(
            sent.as_slice(),
            [RemoteCommand::OpenMessageSubscription(o)] if o.element_instance_key == 100
        ));

        let dup = fx.processor.open_subscription(open(100)).await.unwrap();
        assert!(matches!(
            dup,
            CommandOutcome::Rejected(Rejection::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn unconfirmed_open_is_resent_until_the_confirm_lands() {
        let mut fx = fixture();
        fx.processor.open_subscription(open(100)).await.unwrap();
        // The first open command is lost on the wire.
        fx.gateway.drain(0);

        fx.clock.advance(10_000);
        assert_eq!(
            fx.processor.resend_pending(fx.clock.now_ms()).await.unwrap(),
            1
        );
        let sent = fx.gateway.drain(0);
        assert!(matches!(
            sent.as_slice(),
            [RemoteCommand::OpenMessageSubscription(o)] if o.element_instance_key == 100
        ));
        // Re-stamped sent_at keeps the next sweep quiet.
        assert_eq!(
            fx.processor.resend_pending(fx.clock.now_ms()).await.unwrap(),
            0
        );

        fx.processor
            .on_open_confirmed(100, "order-placed")
            .await
            .unwrap();
        fx.clock.advance(10_000);
        assert_eq!(
            fx.processor.resend_pending(fx.clock.now_ms()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn unconfirmed_close_is_resent_and_mirror_dropped_on_confirm() {
        let mut fx = fixture();
        fx.processor.open_subscription(open(100)).await.unwrap();
        fx.processor
            .on_open_confirmed(100, "order-placed")
            .await
            .unwrap();
        fx.gateway.drain(0);

        fx.processor
            .close_subscription(100, "order-placed")
            .await
            .unwrap();
        // The mirror stays until the correlation partition confirms.
        assert!(fx.processor.state.exists(100, "order-placed"));
        // The first close command is lost on the wire.
        fx.gateway.drain(0);

        fx.clock.advance(10_000);
        assert_eq!(
            fx.processor.resend_pending(fx.clock.now_ms()).await.unwrap(),
            1
        );
        let sent = fx.gateway.drain(0);
        assert!(matches!(
            sent.as_slice(),
            [RemoteCommand::CloseMessageSubscription { element_instance_key: 100, .. }]
        ));

        assert!(fx
            .processor
            .on_close_confirmed(100, "order-placed")
            .await
            .unwrap()
            .is_accepted());
        assert!(!fx.processor.state.exists(100, "order-placed"));

        // A duplicate confirm finds nothing and is tolerated.
        let again = fx
            .processor
            .on_close_confirmed(100, "order-placed")
            .await
            .unwrap();
        assert!(matches!(
            again,
            CommandOutcome::Rejected(Rejection::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn correlate_while_closing_is_rejected_back() {
        let mut fx = fixture();
        fx.processor.open_subscription(open(100)).await.unwrap();
        fx.processor
            .on_open_confirmed(100, "order-placed")
            .await
            .unwrap();
        fx.processor
            .close_subscription(100, "order-placed")
            .await
            .unwrap();
        fx.gateway.drain(0);

        let outcome = fx
            .processor
            .on_correlate(100, "order-placed", "order-17", 42, "{}")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CommandOutcome::Rejected(Rejection::NotFound(_))
        ));
        assert!(fx.activator.applied.lock().unwrap().is_empty());
        let sent = fx.gateway.drain(0);
        assert!(matches!(
            sent.as_slice(),
            [RemoteCommand::RejectCorrelateMessageSubscription { message_key: 42, .. }]
        ));
    }

    #[tokio::test]
    async fn correlate_applies_once_and_reacks_duplicates() {
        let mut fx = fixture();
        fx.processor.open_subscription(open(100)).await.unwrap();
        fx.gateway.drain(0);

        for _ in 0..2 {
            let outcome = fx
                .processor
                .on_correlate(100, "order-placed", "order-17", 42, "{}")
                .await
                .unwrap();
            assert!(outcome.is_accepted());
        }

        // Applied exactly once, acked twice.
        assert_eq!(fx.activator.applied.lock().unwrap().len(), 1);
        let acks = fx
            .gateway
            .drain(0)
            .into_iter()
            .filter(|c| matches!(c, RemoteCommand::CorrelateMessageSubscription { .. }))
            .count();
        assert_eq!(acks, 2);
    }

    #[tokio::test]
    async fn correlate_to_missing_element_is_rejected_back() {
        let mut fx = fixture();
        let outcome = fx
            .processor
            .on_correlate(100, "order-placed", "order-17", 42, "{}")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CommandOutcome::Rejected(Rejection::NotFound(_))
        ));
        let sent = fx.gateway.drain(0);
        assert!(matches!(
            sent.as_slice(),
            [RemoteCommand::RejectCorrelateMessageSubscription { message_key: 42, .. }]
        ));
    }

    #[tokio::test]
    async fn activator_refusal_is_rejected_back() {
        let mut fx = fixture();
        fx.processor.open_subscription(open(100)).await.unwrap();
        fx.gateway.drain(0);
        fx.activator.refuse.store(true, Ordering::SeqCst);

        let outcome = fx
            .processor
            .on_correlate(100, "order-placed", "order-17", 42, "{}")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CommandOutcome::Rejected(Rejection::NotFound(_))
        ));
        assert!(fx.activator.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_event_creation_is_idempotent_per_message() {
        let mut fx = fixture();
        let keys: Vec<Key> = {
            let mut out = Vec::new();
            for _ in 0..2 {
                let CommandOutcome::Accepted { key } = fx
                    .processor
                    .on_correlate_start_event(
                        77,
                        "order-process",
                        "msg-start",
                        "order-placed",
                        "order-17",
                        42,
                        "{}",
                    )
                    .await
                    .unwrap()
                else {
                    panic!("start-event correlate rejected");
                };
                out.push(key);
            }
            out
        };
        assert_eq!(keys[0], keys[1], "retry re-acks the same instance");
        assert_eq!(fx.activator.created.load(Ordering::SeqCst), 1);

        let acks = fx
            .gateway
            .drain(0)
            .into_iter()
            .filter(|c| matches!(c, RemoteCommand::CorrelateStartEventAck { .. }))
            .count();
        assert_eq!(acks, 2);
    }
}
