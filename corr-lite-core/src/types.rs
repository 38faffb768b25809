use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ─── Scalar aliases ───────────────────────────────────────────

/// Engine-assigned record key. Partition-prefixed: the owning partition id
/// sits in the top bits, a per-partition counter in the rest (see `keys`).
pub type Key = u64;

/// Partition identifier (0-based).
pub type PartitionId = u32;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

// ─── Rejections ───────────────────────────────────────────────

/// First-class command rejection. Never a panic, never fatal: a rejection is
/// the expected outcome of duplicate and racing commands, and the caller
/// (usually the retry scheduler) simply tries again later or drops it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Rejection {
    /// Duplicate publish id while the prior message is live, or duplicate
    /// relationship creation.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Duplicate open of an identical subscription (idempotent-retry guard).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Correlate/close/reject against a record that no longer exists.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Outcome of applying a command to a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Command applied; `key` is the primary record key it touched.
    Accepted { key: Key },
    Rejected(Rejection),
}

impl CommandOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandOutcome::Accepted { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            CommandOutcome::Rejected(r) => Some(r),
            CommandOutcome::Accepted { .. } => None,
        }
    }
}

// ─── Message ──────────────────────────────────────────────────

/// The publish command as handed to the correlation partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishMessage {
    pub name: String,
    pub correlation_key: String,
    /// Producer-supplied dedup id. Empty = no deduplication.
    pub message_id: String,
    /// Opaque JSON — never parsed by the correlation engine.
    pub variables: String,
    /// Time to live. `<= 0` means immediately expirable: the message is
    /// stored and published but never eligible for matching.
    pub ttl_ms: i64,
}

/// A published, buffered message owned by its correlation-key partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_key: Key,
    pub name: String,
    pub correlation_key: String,
    pub message_id: String,
    pub variables: String,
    /// Absolute deadline. The message is matchable only while `now < deadline`.
    pub deadline_ms: Timestamp,
}

// ─── Message subscription (correlation-key partition) ─────────

/// In-flight correlate bookkeeping while a subscription is correlating.
/// Variables are carried here so the retry sweep can re-send the correlate
/// command even after the message itself expired.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightCorrelation {
    pub message_key: Key,
    pub variables: String,
    /// When the correlate command was (last) sent. Drives the retry sweep.
    pub sent_at: Timestamp,
}

/// One waiting point, owned by the correlation-key partition.
/// Unique per (process instance, element instance, message name).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageSubscriptionRecord {
    pub subscription_key: Key,
    pub process_instance_key: Key,
    pub element_instance_key: Key,
    pub message_name: String,
    pub correlation_key: String,
    /// Interrupting subscriptions are consumed by one successful correlation;
    /// non-interrupting ones return to idle and may correlate again.
    pub interrupting: bool,
    /// `Some` while a correlate command is out to the instance partition.
    /// At most one in-flight message at a time.
    pub correlating: Option<InFlightCorrelation>,
    /// Message keys this subscription must never re-match because the
    /// instance partition rejected them. Entries are pruned when their
    /// message leaves the store.
    pub excluded_messages: BTreeSet<Key>,
}

impl MessageSubscriptionRecord {
    pub fn is_idle(&self) -> bool {
        self.correlating.is_none()
    }
}

/// The open-subscription command sent from the instance partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenSubscription {
    pub process_instance_key: Key,
    pub element_instance_key: Key,
    pub message_name: String,
    pub correlation_key: String,
    pub interrupting: bool,
}

// ─── Process-message subscription (instance partition) ────────

/// Lifecycle of a mirror record. The open and close requests travel over
/// the same lossy gateway as correlates, so both sit in a pending state
/// until the correlation partition confirms them; pending entries are
/// re-sent by the instance-side retry sweep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorLifecycle {
    /// Open request sent, confirmation outstanding.
    Opening { sent_at: Timestamp },
    /// Confirmed on both sides.
    Open,
    /// Close request sent; the record is kept until confirmed so the sweep
    /// can re-send the close.
    Closing { sent_at: Timestamp },
}

/// Mirror record owned by the instance partition. Tracks which message keys
/// have already been applied so a re-delivered correlate is a duplicate-ack,
/// never a double-apply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessMessageSubscriptionRecord {
    pub process_instance_key: Key,
    pub element_instance_key: Key,
    pub message_name: String,
    pub correlation_key: String,
    pub interrupting: bool,
    pub lifecycle: MirrorLifecycle,
    pub correlated_messages: BTreeSet<Key>,
}

// ─── Message start events ─────────────────────────────────────

/// Persistent subscription for a message start event, one per
/// (process definition, message name). Registered on every partition, since
/// any correlation key may route to any partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartEventSubscriptionRecord {
    pub subscription_key: Key,
    pub process_definition_key: Key,
    /// The process id, e.g. the BPMN process id. With the correlation key it
    /// forms the exclusivity lock pair.
    pub process_id: String,
    pub start_event_id: String,
    pub message_name: String,
}

/// Correlation-key lock state for one (process id, correlation key) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartEventLock {
    /// A start-instance correlate command is out; re-sent by the retry sweep.
    Correlating {
        process_definition_key: Key,
        start_event_id: String,
        message_name: String,
        message_key: Key,
        variables: String,
        sent_at: Timestamp,
    },
    /// The instance is alive; released when it completes or terminates.
    Active { process_instance_key: Key },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_formats_with_context() {
        let r = Rejection::AlreadyExists("message id 'order-9'".into());
        assert_eq!(r.to_string(), "already exists: message id 'order-9'");
        assert!(CommandOutcome::Rejected(r).rejection().is_some());
    }

    #[test]
    fn subscription_idle_until_correlating() {
        let mut sub = MessageSubscriptionRecord {
            subscription_key: 1,
            process_instance_key: 2,
            element_instance_key: 3,
            message_name: "order-placed".into(),
            correlation_key: "order-123".into(),
            interrupting: true,
            correlating: None,
            excluded_messages: BTreeSet::new(),
        };
        assert!(sub.is_idle());
        sub.correlating = Some(InFlightCorrelation {
            message_key: 9,
            variables: "{}".into(),
            sent_at: 0,
        });
        assert!(!sub.is_idle());
    }
}
