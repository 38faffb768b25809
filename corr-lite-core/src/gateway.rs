use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Cross-partition commands. Fire-and-forget, at-least-once, unordered
/// between partitions; any of these may be silently dropped, and every
/// receiving handler tolerates duplicates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RemoteCommand {
    // ── instance partition → correlation partition ──
    OpenMessageSubscription(OpenSubscription),
    CloseMessageSubscription {
        process_instance_key: Key,
        element_instance_key: Key,
        message_name: String,
        correlation_key: String,
    },
    /// Acknowledgement: the message was applied to the live element.
    CorrelateMessageSubscription {
        element_instance_key: Key,
        message_name: String,
        correlation_key: String,
        message_key: Key,
    },
    /// The element was not in a correlatable state; free the message.
    RejectCorrelateMessageSubscription {
        element_instance_key: Key,
        message_name: String,
        correlation_key: String,
        message_key: Key,
    },
    /// Acknowledgement for a start-event correlation, carrying the key of
    /// the created instance so the exclusivity lock can pin it.
    CorrelateStartEventAck {
        process_id: String,
        correlation_key: String,
        message_key: Key,
        process_instance_key: Key,
    },

    // ── correlation partition → instance partition ──
    /// The subscription exists on the correlation partition; the mirror may
    /// leave `Opening`. Re-sent for duplicate opens so a lost confirmation
    /// heals on retry.
    OpenMessageSubscriptionConfirmed {
        element_instance_key: Key,
        message_name: String,
    },
    /// The subscription is gone on the correlation partition; the mirror may
    /// be deleted. Also sent for a close that found nothing.
    CloseMessageSubscriptionConfirmed {
        element_instance_key: Key,
        message_name: String,
    },
    CorrelateProcessSubscription {
        process_instance_key: Key,
        element_instance_key: Key,
        message_name: String,
        correlation_key: String,
        message_key: Key,
        variables: String,
    },
    CorrelateStartEvent {
        process_definition_key: Key,
        process_id: String,
        start_event_id: String,
        message_name: String,
        correlation_key: String,
        message_key: Key,
        variables: String,
    },
}

/// Inter-partition gateway collaborator. No delivery confirmation is visible
/// to the sender; loss is recovered exclusively by the retry scheduler.
#[async_trait]
pub trait SubscriptionGateway: Send + Sync {
    async fn send(&self, target: PartitionId, command: RemoteCommand) -> Result<()>;
}

type DropFilter = Box<dyn Fn(&RemoteCommand) -> bool + Send + Sync>;

/// In-memory gateway: one inbox per partition, drained by the cluster pump.
/// A drop filter lets tests lose specific commands on the wire.
#[derive(Default)]
pub struct MemoryGateway {
    inboxes: Mutex<BTreeMap<PartitionId, VecDeque<RemoteCommand>>>,
    drop_filter: Mutex<Option<DropFilter>>,
    dropped: Mutex<Vec<RemoteCommand>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every sent command matching the filter until the filter is
    /// cleared. Dropped commands are retained for assertions.
    pub fn drop_matching(&self, filter: impl Fn(&RemoteCommand) -> bool + Send + Sync + 'static) {
        *self.drop_filter.lock().unwrap() = Some(Box::new(filter));
    }

    pub fn deliver_everything(&self) {
        *self.drop_filter.lock().unwrap() = None;
    }

    pub fn dropped(&self) -> Vec<RemoteCommand> {
        self.dropped.lock().unwrap().clone()
    }

    /// Take all pending commands for one partition.
    pub fn drain(&self, partition: PartitionId) -> Vec<RemoteCommand> {
        self.inboxes
            .lock()
            .unwrap()
            .get_mut(&partition)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn is_idle(&self) -> bool {
        self.inboxes.lock().unwrap().values().all(VecDeque::is_empty)
    }
}

#[async_trait]
impl SubscriptionGateway for MemoryGateway {
    async fn send(&self, target: PartitionId, command: RemoteCommand) -> Result<()> {
        if let Some(filter) = self.drop_filter.lock().unwrap().as_ref() {
            if filter(&command) {
                tracing::debug!(target_partition = target, ?command, "dropping command");
                self.dropped.lock().unwrap().push(command);
                return Ok(());
            }
        }
        self.inboxes
            .lock()
            .unwrap()
            .entry(target)
            .or_default()
            .push_back(command);
        Ok(())
    }
}
