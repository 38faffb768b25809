use crate::types::*;
use std::collections::{BTreeMap, BTreeSet};

/// Per-partition message-subscription store (the correlation side of the
/// two-sided split). One record per (process instance, element instance,
/// message name); FIFO matching order is subscription-key order, which is
/// creation order.
#[derive(Default)]
pub struct MessageSubscriptionState {
    by_key: BTreeMap<Key, MessageSubscriptionRecord>,
    /// (element instance key, message name) → subscription key.
    by_element: BTreeMap<(Key, String), Key>,
    /// (message name, correlation key) → subscription keys in creation order.
    by_message: BTreeMap<(String, String), BTreeSet<Key>>,
    /// sent_at-ordered index over correlating subscriptions, for the retry
    /// sweep. Kept in sync by begin/clear/touch below.
    in_flight: BTreeSet<(Timestamp, Key)>,
}

impl MessageSubscriptionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// True if a subscription identical to the open command already exists.
    pub fn exists(&self, open: &OpenSubscription) -> bool {
        self.by_element
            .get(&(open.element_instance_key, open.message_name.clone()))
            .and_then(|k| self.by_key.get(k))
            .is_some_and(|sub| sub.process_instance_key == open.process_instance_key)
    }

    pub fn put(&mut self, record: MessageSubscriptionRecord) {
        self.by_element.insert(
            (record.element_instance_key, record.message_name.clone()),
            record.subscription_key,
        );
        self.by_message
            .entry((record.message_name.clone(), record.correlation_key.clone()))
            .or_default()
            .insert(record.subscription_key);
        self.by_key.insert(record.subscription_key, record);
    }

    pub fn get(&self, subscription_key: Key) -> Option<&MessageSubscriptionRecord> {
        self.by_key.get(&subscription_key)
    }

    pub fn key_for_element(&self, element_instance_key: Key, name: &str) -> Option<Key> {
        self.by_element
            .get(&(element_instance_key, name.to_string()))
            .copied()
    }

    pub fn remove(&mut self, subscription_key: Key) -> Option<MessageSubscriptionRecord> {
        let record = self.by_key.remove(&subscription_key)?;
        self.by_element
            .remove(&(record.element_instance_key, record.message_name.clone()));
        if let Some(set) = self
            .by_message
            .get_mut(&(record.message_name.clone(), record.correlation_key.clone()))
        {
            set.remove(&subscription_key);
            if set.is_empty() {
                self.by_message
                    .remove(&(record.message_name.clone(), record.correlation_key.clone()));
            }
        }
        if let Some(inflight) = &record.correlating {
            self.in_flight.remove(&(inflight.sent_at, subscription_key));
        }
        Some(record)
    }

    /// Idle subscriptions for (name, correlation key), oldest first.
    pub fn idle_subscriptions(&self, name: &str, correlation_key: &str) -> Vec<Key> {
        self.by_message
            .get(&(name.to_string(), correlation_key.to_string()))
            .map(|set| {
                set.iter()
                    .filter(|k| self.by_key.get(k).is_some_and(|s| s.is_idle()))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transition idle → correlating, registering the retry-index entry.
    pub fn begin_correlating(&mut self, subscription_key: Key, inflight: InFlightCorrelation) {
        if let Some(sub) = self.by_key.get_mut(&subscription_key) {
            debug_assert!(sub.correlating.is_none(), "one in-flight message at a time");
            self.in_flight.insert((inflight.sent_at, subscription_key));
            sub.correlating = Some(inflight);
        }
    }

    /// Transition correlating → idle; returns the in-flight bookkeeping.
    pub fn clear_correlating(&mut self, subscription_key: Key) -> Option<InFlightCorrelation> {
        let sub = self.by_key.get_mut(&subscription_key)?;
        let inflight = sub.correlating.take()?;
        self.in_flight.remove(&(inflight.sent_at, subscription_key));
        Some(inflight)
    }

    /// Re-stamp sent_at after a retry re-send so the sweep does not spin on
    /// the same subscription every interval.
    pub fn touch_sent_at(&mut self, subscription_key: Key, now: Timestamp) {
        if let Some(sub) = self.by_key.get_mut(&subscription_key) {
            if let Some(inflight) = &mut sub.correlating {
                self.in_flight.remove(&(inflight.sent_at, subscription_key));
                inflight.sent_at = now;
                self.in_flight.insert((now, subscription_key));
            }
        }
    }

    pub fn exclude_message(&mut self, subscription_key: Key, message_key: Key) {
        if let Some(sub) = self.by_key.get_mut(&subscription_key) {
            sub.excluded_messages.insert(message_key);
        }
    }

    /// Drop `message_key` from every exclusion set. Called when the message
    /// leaves the store; the sets must not outlive the messages they name.
    pub fn prune_excluded(&mut self, message_key: Key) {
        for sub in self.by_key.values_mut() {
            sub.excluded_messages.remove(&message_key);
        }
    }

    /// Subscriptions stuck correlating since before `cutoff`, oldest first.
    pub fn stuck_since(&self, cutoff: Timestamp) -> Vec<Key> {
        self.in_flight
            .iter()
            .take_while(|(sent_at, _)| *sent_at <= cutoff)
            .map(|(_, key)| *key)
            .collect()
    }
}

/// Message-start-event subscriptions plus the correlation-key exclusivity
/// locks. Also correlation-side state: any correlation key can route here.
#[derive(Default)]
pub struct StartEventSubscriptionState {
    by_key: BTreeMap<Key, StartEventSubscriptionRecord>,
    /// (process definition key, message name) → subscription key.
    by_definition: BTreeMap<(Key, String), Key>,
    /// message name → subscription keys in creation order.
    by_name: BTreeMap<String, BTreeSet<Key>>,
    /// (process id, correlation key) → lock. At most one live instance per
    /// pair; `Correlating` entries are re-sent by the retry sweep.
    locks: BTreeMap<(String, String), StartEventLock>,
    /// Active instance key → lock key, for release on instance completion.
    lock_by_instance: BTreeMap<Key, (String, String)>,
    /// Instances reported finished while their start-event ack was still in
    /// flight. The late ack must release the lock instead of pinning it.
    finished_before_ack: BTreeSet<Key>,
}

impl StartEventSubscriptionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, process_definition_key: Key, name: &str) -> bool {
        self.by_definition
            .contains_key(&(process_definition_key, name.to_string()))
    }

    pub fn put(&mut self, record: StartEventSubscriptionRecord) {
        self.by_definition.insert(
            (record.process_definition_key, record.message_name.clone()),
            record.subscription_key,
        );
        self.by_name
            .entry(record.message_name.clone())
            .or_default()
            .insert(record.subscription_key);
        self.by_key.insert(record.subscription_key, record);
    }

    pub fn remove(&mut self, process_definition_key: Key, name: &str) -> Option<StartEventSubscriptionRecord> {
        let key = self
            .by_definition
            .remove(&(process_definition_key, name.to_string()))?;
        let record = self.by_key.remove(&key)?;
        if let Some(set) = self.by_name.get_mut(&record.message_name) {
            set.remove(&key);
            if set.is_empty() {
                self.by_name.remove(&record.message_name);
            }
        }
        Some(record)
    }

    /// Start-event subscriptions listening on `name`, oldest first.
    pub fn subscriptions_for(&self, name: &str) -> Vec<&StartEventSubscriptionRecord> {
        self.by_name
            .get(name)
            .map(|set| set.iter().filter_map(|k| self.by_key.get(k)).collect())
            .unwrap_or_default()
    }

    /// Start-event subscriptions belonging to one process id, oldest first.
    pub fn subscriptions_for_process(&self, process_id: &str) -> Vec<&StartEventSubscriptionRecord> {
        self.by_key
            .values()
            .filter(|s| s.process_id == process_id)
            .collect()
    }

    pub fn lock(&self, process_id: &str, correlation_key: &str) -> Option<&StartEventLock> {
        self.locks
            .get(&(process_id.to_string(), correlation_key.to_string()))
    }

    pub fn put_lock(&mut self, process_id: &str, correlation_key: &str, lock: StartEventLock) {
        let key = (process_id.to_string(), correlation_key.to_string());
        if let Some(StartEventLock::Active {
            process_instance_key,
        }) = self.locks.get(&key)
        {
            self.lock_by_instance.remove(process_instance_key);
        }
        if let StartEventLock::Active {
            process_instance_key,
        } = &lock
        {
            self.lock_by_instance
                .insert(*process_instance_key, key.clone());
        }
        self.locks.insert(key, lock);
    }

    pub fn release_lock_for_instance(&mut self, process_instance_key: Key) -> Option<(String, String)> {
        let key = self.lock_by_instance.remove(&process_instance_key)?;
        self.locks.remove(&key);
        Some(key)
    }

    pub fn remove_lock(&mut self, process_id: &str, correlation_key: &str) {
        let key = (process_id.to_string(), correlation_key.to_string());
        if let Some(StartEventLock::Active {
            process_instance_key,
        }) = self.locks.remove(&key)
        {
            self.lock_by_instance.remove(&process_instance_key);
        }
    }

    pub fn mark_finished_before_ack(&mut self, process_instance_key: Key) {
        self.finished_before_ack.insert(process_instance_key);
    }

    pub fn take_finished_before_ack(&mut self, process_instance_key: Key) -> bool {
        self.finished_before_ack.remove(&process_instance_key)
    }

    /// Lock keys stuck correlating since before `cutoff`.
    pub fn stuck_locks(&self, cutoff: Timestamp) -> Vec<(String, String)> {
        self.locks
            .iter()
            .filter(|(_, lock)| {
                matches!(lock, StartEventLock::Correlating { sent_at, .. } if *sent_at <= cutoff)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn lock_mut(&mut self, process_id: &str, correlation_key: &str) -> Option<&mut StartEventLock> {
        self.locks
            .get_mut(&(process_id.to_string(), correlation_key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(key: Key, element: Key, name: &str, cork: &str) -> MessageSubscriptionRecord {
        MessageSubscriptionRecord {
            subscription_key: key,
            process_instance_key: 100,
            element_instance_key: element,
            message_name: name.into(),
            correlation_key: cork.into(),
            interrupting: true,
            correlating: None,
            excluded_messages: BTreeSet::new(),
        }
    }

    #[test]
    fn idle_subscriptions_come_back_oldest_first() {
        let mut state = MessageSubscriptionState::new();
        state.put(subscription(2, 20, "m", "k"));
        state.put(subscription(1, 10, "m", "k"));
        assert_eq!(state.idle_subscriptions("m", "k"), vec![1, 2]);
    }

    #[test]
    fn correlating_subscriptions_are_not_idle() {
        let mut state = MessageSubscriptionState::new();
        state.put(subscription(1, 10, "m", "k"));
        state.begin_correlating(
            1,
            InFlightCorrelation {
                message_key: 50,
                variables: "{}".into(),
                sent_at: 5,
            },
        );
        assert!(state.idle_subscriptions("m", "k").is_empty());
        assert_eq!(state.stuck_since(5), vec![1]);

        let inflight = state.clear_correlating(1).unwrap();
        assert_eq!(inflight.message_key, 50);
        assert_eq!(state.idle_subscriptions("m", "k"), vec![1]);
        assert!(state.stuck_since(5).is_empty());
    }

    #[test]
    fn touch_sent_at_moves_the_retry_entry() {
        let mut state = MessageSubscriptionState::new();
        state.put(subscription(1, 10, "m", "k"));
        state.begin_correlating(
            1,
            InFlightCorrelation {
                message_key: 50,
                variables: "{}".into(),
                sent_at: 5,
            },
        );
        state.touch_sent_at(1, 30);
        assert!(state.stuck_since(29).is_empty());
        assert_eq!(state.stuck_since(30), vec![1]);
    }

    #[test]
    fn duplicate_open_is_detected() {
        let mut state = MessageSubscriptionState::new();
        state.put(subscription(1, 10, "m", "k"));
        let open = OpenSubscription {
            process_instance_key: 100,
            element_instance_key: 10,
            message_name: "m".into(),
            correlation_key: "k".into(),
            interrupting: true,
        };
        assert!(state.exists(&open));
        state.remove(1);
        assert!(!state.exists(&open));
    }

    #[test]
    fn prune_excluded_clears_every_subscription() {
        let mut state = MessageSubscriptionState::new();
        state.put(subscription(1, 10, "m", "k"));
        state.put(subscription(2, 20, "m", "k"));
        state.exclude_message(1, 50);
        state.exclude_message(2, 50);
        state.exclude_message(2, 51);
        state.prune_excluded(50);
        assert!(state.get(1).unwrap().excluded_messages.is_empty());
        assert_eq!(
            state.get(2).unwrap().excluded_messages,
            BTreeSet::from([51])
        );
    }

    #[test]
    fn start_event_lock_round_trip() {
        let mut state = StartEventSubscriptionState::new();
        assert!(state.lock("proc", "k").is_none());
        state.put_lock(
            "proc",
            "k",
            StartEventLock::Active {
                process_instance_key: 77,
            },
        );
        assert!(state.lock("proc", "k").is_some());
        assert_eq!(
            state.release_lock_for_instance(77),
            Some(("proc".to_string(), "k".to_string()))
        );
        assert!(state.lock("proc", "k").is_none());
    }
}
