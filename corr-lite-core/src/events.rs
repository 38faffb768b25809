use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Correlation events — the durable audit trail, one record per applied
/// command (plus protocol follow-ups such as `SubscriptionCorrelating`).
/// Replay is a pure fold over this log; nothing in the stores exists that
/// cannot be rebuilt from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CorrelationEvent {
    // ── Message ──
    MessagePublished {
        message_key: Key,
        name: String,
        correlation_key: String,
        message_id: String,
        deadline_ms: Timestamp,
    },
    MessageExpired {
        message_key: Key,
        name: String,
    },

    // ── Message subscription (correlation-key partition) ──
    SubscriptionCreated {
        subscription_key: Key,
        process_instance_key: Key,
        element_instance_key: Key,
        name: String,
        correlation_key: String,
        interrupting: bool,
    },
    /// A correlate command went out to the instance partition.
    SubscriptionCorrelating {
        subscription_key: Key,
        message_key: Key,
    },
    SubscriptionCorrelated {
        subscription_key: Key,
        message_key: Key,
    },
    SubscriptionRejected {
        subscription_key: Key,
        message_key: Key,
    },
    SubscriptionDeleted {
        subscription_key: Key,
    },

    // ── Process-message subscription (instance partition) ──
    ProcessSubscriptionCreated {
        element_instance_key: Key,
        name: String,
    },
    ProcessSubscriptionCorrelated {
        element_instance_key: Key,
        name: String,
        message_key: Key,
    },
    ProcessSubscriptionDeleted {
        element_instance_key: Key,
        name: String,
    },

    // ── Message start events ──
    StartEventSubscriptionCreated {
        subscription_key: Key,
        process_definition_key: Key,
        name: String,
    },
    StartEventSubscriptionCorrelated {
        process_definition_key: Key,
        name: String,
        message_key: Key,
        process_instance_key: Key,
    },
    StartEventSubscriptionDeleted {
        process_definition_key: Key,
        name: String,
    },
}

/// State-log writer collaborator. The engine appends exactly in apply order;
/// the log infrastructure behind this trait is out of scope.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the partition's log and return its sequence number.
    async fn append(&self, partition: PartitionId, event: &CorrelationEvent) -> Result<u64>;
}

/// In-memory log, one append-only sequence per partition.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<BTreeMap<PartitionId, Vec<CorrelationEvent>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, partition: PartitionId) -> Vec<(u64, CorrelationEvent)> {
        self.entries
            .lock()
            .unwrap()
            .get(&partition)
            .map(|v| {
                v.iter()
                    .enumerate()
                    .map(|(i, e)| (i as u64 + 1, e.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All events across partitions, in append order per partition.
    pub fn read_all(&self) -> Vec<(PartitionId, CorrelationEvent)> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .flat_map(|(p, v)| v.iter().map(|e| (*p, e.clone())))
            .collect()
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(&self, partition: PartitionId, event: &CorrelationEvent) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap();
        let log = entries.entry(partition).or_default();
        log.push(event.clone());
        Ok(log.len() as u64)
    }
}
