use crate::clock::{EngineClock, ManualClock};
use crate::config::CorrelationConfig;
use crate::correlation::CorrelationProcessor;
use crate::events::MemoryLog;
use crate::gateway::{MemoryGateway, RemoteCommand};
use crate::instance::{ElementActivator, InstanceProcessor};
use crate::keys::{self, KeyGenerator};
use crate::router;
use crate::scheduler::CorrelationScheduler;
use crate::types::*;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A recorded message application, in apply order.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub element_instance_key: Key,
    pub message_name: String,
    pub variables: String,
}

/// An instance created from a message start event.
#[derive(Clone, Debug, PartialEq)]
pub struct StartedInstance {
    pub process_definition_key: Key,
    pub process_instance_key: Key,
    pub variables: String,
}

#[derive(Default)]
struct ScopeInner {
    /// Live scopes. A consuming correlation kills its scope, which is what
    /// makes racing siblings lose with NOT_FOUND.
    scopes: BTreeSet<Key>,
    /// element instance key → (owning scope, whether winning consumes it).
    elements: BTreeMap<Key, (Key, bool)>,
    deliveries: Vec<Delivery>,
    instances: Vec<StartedInstance>,
}

/// In-memory element activator modelling just enough element semantics for
/// the protocol: elements live in scopes, interrupting waits consume their
/// scope on success, and a dead scope makes every later correlate fail.
pub struct ScopeActivator {
    inner: Mutex<ScopeInner>,
    keygens: Vec<Arc<KeyGenerator>>,
}

impl ScopeActivator {
    pub fn new(keygens: Vec<Arc<KeyGenerator>>) -> Self {
        Self {
            inner: Mutex::new(ScopeInner::default()),
            keygens,
        }
    }

    pub fn register_scope(&self, scope_key: Key) {
        self.inner.lock().unwrap().scopes.insert(scope_key);
    }

    /// Register a waiting element. `consumes_scope` models an interrupting
    /// wait (event-gateway branch, interrupting boundary): winning resolves
    /// the whole scope.
    pub fn register_element(&self, element_instance_key: Key, scope_key: Key, consumes_scope: bool) {
        self.inner
            .lock()
            .unwrap()
            .elements
            .insert(element_instance_key, (scope_key, consumes_scope));
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.inner.lock().unwrap().deliveries.clone()
    }

    pub fn instances(&self) -> Vec<StartedInstance> {
        self.inner.lock().unwrap().instances.clone()
    }
}

#[async_trait]
impl ElementActivator for ScopeActivator {
    async fn correlate_to_element(
        &self,
        element_instance_key: Key,
        message_name: &str,
        variables: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some((scope_key, consumes_scope)) = inner.elements.get(&element_instance_key).copied()
        else {
            return Ok(false);
        };
        if !inner.scopes.contains(&scope_key) {
            return Ok(false);
        }
        inner.deliveries.push(Delivery {
            element_instance_key,
            message_name: message_name.to_string(),
            variables: variables.to_string(),
        });
        if consumes_scope {
            inner.scopes.remove(&scope_key);
        }
        Ok(true)
    }

    async fn create_instance(
        &self,
        partition: PartitionId,
        process_definition_key: Key,
        _start_event_id: &str,
        variables: &str,
    ) -> Result<Key> {
        let key = self.keygens[partition as usize].next_key();
        self.inner.lock().unwrap().instances.push(StartedInstance {
            process_definition_key,
            process_instance_key: key,
            variables: variables.to_string(),
        });
        Ok(key)
    }
}

/// One partition: both processor sides plus its scheduler. The pump applies
/// commands strictly sequentially per partition.
pub struct Partition {
    pub correlation: CorrelationProcessor,
    pub instance: InstanceProcessor,
    pub scheduler: CorrelationScheduler,
}

/// Deterministic in-memory cluster: N partitions connected only by the
/// droppable gateway, a manual clock, and a shared event log.
pub struct Cluster {
    config: CorrelationConfig,
    pub partitions: Vec<Partition>,
    pub gateway: Arc<MemoryGateway>,
    pub log: Arc<MemoryLog>,
    pub clock: Arc<ManualClock>,
    pub activator: Arc<ScopeActivator>,
    keygens: Vec<Arc<KeyGenerator>>,
}

impl Cluster {
    pub fn new(config: CorrelationConfig) -> Self {
        let gateway = Arc::new(MemoryGateway::new());
        let log = Arc::new(MemoryLog::new());
        let clock = ManualClock::new(0);
        let keygens: Vec<Arc<KeyGenerator>> = (0..config.partition_count)
            .map(|p| Arc::new(KeyGenerator::new(p)))
            .collect();
        let activator = Arc::new(ScopeActivator::new(keygens.clone()));

        let partitions = (0..config.partition_count)
            .map(|p| Partition {
                correlation: CorrelationProcessor::new(
                    p,
                    config.clone(),
                    keygens[p as usize].clone(),
                    clock.clone(),
                    log.clone(),
                    gateway.clone(),
                ),
                instance: InstanceProcessor::new(
                    p,
                    config.clone(),
                    activator.clone(),
                    clock.clone(),
                    log.clone(),
                    gateway.clone(),
                ),
                scheduler: CorrelationScheduler::new(config.scheduler_interval_ms),
            })
            .collect();

        Self {
            config,
            partitions,
            gateway,
            log,
            clock,
            activator,
            keygens,
        }
    }

    /// Allocate an engine key on a partition (tests use this for process
    /// instance and element instance keys, which the real engine assigns).
    pub fn next_key(&self, partition: PartitionId) -> Key {
        self.keygens[partition as usize].next_key()
    }

    pub fn route(&self, correlation_key: &str) -> PartitionId {
        router::partition_for(correlation_key, self.config.partition_count)
    }

    // ── External entry points ──

    pub async fn publish(&mut self, publish: PublishMessage) -> Result<CommandOutcome> {
        let partition = self.route(&publish.correlation_key);
        self.partitions[partition as usize]
            .correlation
            .on_publish(publish)
            .await
    }

    /// Open a waiting point on the instance partition owning the element.
    pub async fn open_subscription(&mut self, open: OpenSubscription) -> Result<CommandOutcome> {
        let partition = keys::partition_of(open.element_instance_key);
        self.partitions[partition as usize]
            .instance
            .open_subscription(open)
            .await
    }

    pub async fn close_subscription(
        &mut self,
        element_instance_key: Key,
        message_name: &str,
    ) -> Result<CommandOutcome> {
        let partition = keys::partition_of(element_instance_key);
        self.partitions[partition as usize]
            .instance
            .close_subscription(element_instance_key, message_name)
            .await
    }

    /// Register a message start event on every partition, as deployment
    /// distribution does.
    pub async fn deploy_start_event(
        &mut self,
        process_definition_key: Key,
        process_id: &str,
        start_event_id: &str,
        message_name: &str,
    ) -> Result<()> {
        for partition in &mut self.partitions {
            partition
                .correlation
                .on_open_start_event_subscription(
                    process_definition_key,
                    process_id,
                    start_event_id,
                    message_name,
                )
                .await?;
        }
        Ok(())
    }

    /// Report an instance as completed/terminated, releasing any
    /// correlation-key lock it holds.
    pub async fn finish_instance(&mut self, process_instance_key: Key) -> Result<CommandOutcome> {
        let partition = keys::partition_of(process_instance_key);
        self.partitions[partition as usize]
            .correlation
            .on_instance_finished(process_instance_key)
            .await
    }

    // ── Pump ──

    /// Deliver queued inter-partition commands until the wire is quiet.
    pub async fn run_until_idle(&mut self) -> Result<()> {
        for _ in 0..10_000 {
            let mut delivered = false;
            for partition in 0..self.config.partition_count {
                for command in self.gateway.drain(partition) {
                    delivered = true;
                    self.deliver(partition, command).await?;
                }
            }
            if !delivered {
                return Ok(());
            }
        }
        bail!("cluster did not quiesce; protocol is ping-ponging");
    }

    /// Advance the clock and run every partition's scheduler, then pump.
    pub async fn advance(&mut self, ms: i64) -> Result<()> {
        self.clock.advance(ms);
        let now = self.clock.now_ms();
        for partition in &mut self.partitions {
            partition
                .scheduler
                .on_tick(now, &mut partition.correlation, &mut partition.instance)
                .await?;
        }
        self.run_until_idle().await
    }

    async fn deliver(&mut self, partition: PartitionId, command: RemoteCommand) -> Result<()> {
        let slot = &mut self.partitions[partition as usize];
        let outcome = match command {
            RemoteCommand::OpenMessageSubscription(open) => {
                slot.correlation.on_open_subscription(open).await?
            }
            RemoteCommand::CloseMessageSubscription {
                element_instance_key,
                message_name,
                ..
            } => {
                slot.correlation
                    .on_close_subscription(element_instance_key, &message_name)
                    .await?
            }
            RemoteCommand::CorrelateMessageSubscription {
                element_instance_key,
                message_name,
                message_key,
                ..
            } => {
                slot.correlation
                    .on_correlate_acked(element_instance_key, &message_name, message_key)
                    .await?
            }
            RemoteCommand::RejectCorrelateMessageSubscription {
                element_instance_key,
                message_name,
                message_key,
                ..
            } => {
                slot.correlation
                    .on_correlate_rejected(element_instance_key, &message_name, message_key)
                    .await?
            }
            RemoteCommand::OpenMessageSubscriptionConfirmed {
                element_instance_key,
                message_name,
            } => {
                slot.instance
                    .on_open_confirmed(element_instance_key, &message_name)
                    .await?
            }
            RemoteCommand::CloseMessageSubscriptionConfirmed {
                element_instance_key,
                message_name,
            } => {
                slot.instance
                    .on_close_confirmed(element_instance_key, &message_name)
                    .await?
            }
            RemoteCommand::CorrelateStartEventAck {
                process_id,
                correlation_key,
                message_key,
                process_instance_key,
            } => {
                slot.correlation
                    .on_start_event_acked(
                        &process_id,
                        &correlation_key,
                        message_key,
                        process_instance_key,
                    )
                    .await?
            }
            RemoteCommand::CorrelateProcessSubscription {
                element_instance_key,
                message_name,
                correlation_key,
                message_key,
                variables,
                ..
            } => {
                slot.instance
                    .on_correlate(
                        element_instance_key,
                        &message_name,
                        &correlation_key,
                        message_key,
                        &variables,
                    )
                    .await?
            }
            RemoteCommand::CorrelateStartEvent {
                process_definition_key,
                process_id,
                start_event_id,
                message_name,
                correlation_key,
                message_key,
                variables,
            } => {
                slot.instance
                    .on_correlate_start_event(
                        process_definition_key,
                        &process_id,
                        &start_event_id,
                        &message_name,
                        &correlation_key,
                        message_key,
                        &variables,
                    )
                    .await?
            }
        };
        // Rejections of remote commands drive state transitions or are
        // tolerated duplicates; nothing here is fatal.
        if let CommandOutcome::Rejected(rejection) = outcome {
            debug!(partition, %rejection, "remote command rejected");
        }
        Ok(())
    }
}
