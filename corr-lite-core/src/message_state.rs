use crate::types::*;
use std::collections::{BTreeMap, BTreeSet};

/// Per-partition message store. Owned and mutated only by the partition's
/// correlation processor; never shared across partitions.
///
/// Buffered order within one (name, correlation key) pair is message-key
/// order, which is publish order because keys are monotonic per partition.
#[derive(Default)]
pub struct MessageState {
    by_key: BTreeMap<Key, MessageRecord>,
    /// (name, message_id) → key, for non-empty producer ids only.
    by_id: BTreeMap<(String, String), Key>,
    /// Deadline-ordered index for the expiry sweep.
    deadlines: BTreeSet<(Timestamp, Key)>,
    /// (name, correlation key) → buffered message keys in publish order.
    buffered: BTreeMap<(String, String), BTreeSet<Key>>,
    /// Messages referenced by an in-flight correlate; not matchable.
    held: BTreeSet<Key>,
}

impl MessageState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a live message with this (name, non-empty id) exists.
    pub fn has_live_id(&self, name: &str, message_id: &str) -> bool {
        !message_id.is_empty()
            && self
                .by_id
                .contains_key(&(name.to_string(), message_id.to_string()))
    }

    pub fn put(&mut self, record: MessageRecord) {
        if !record.message_id.is_empty() {
            self.by_id.insert(
                (record.name.clone(), record.message_id.clone()),
                record.message_key,
            );
        }
        self.deadlines.insert((record.deadline_ms, record.message_key));
        self.buffered
            .entry((record.name.clone(), record.correlation_key.clone()))
            .or_default()
            .insert(record.message_key);
        self.by_key.insert(record.message_key, record);
    }

    pub fn get(&self, key: Key) -> Option<&MessageRecord> {
        self.by_key.get(&key)
    }

    /// Remove a message from every index. Expiry and full consumption both
    /// end here.
    pub fn remove(&mut self, key: Key) -> Option<MessageRecord> {
        let record = self.by_key.remove(&key)?;
        if !record.message_id.is_empty() {
            self.by_id
                .remove(&(record.name.clone(), record.message_id.clone()));
        }
        self.deadlines.remove(&(record.deadline_ms, key));
        if let Some(set) = self
            .buffered
            .get_mut(&(record.name.clone(), record.correlation_key.clone()))
        {
            set.remove(&key);
            if set.is_empty() {
                self.buffered
                    .remove(&(record.name.clone(), record.correlation_key.clone()));
            }
        }
        self.held.remove(&key);
        Some(record)
    }

    pub fn hold(&mut self, key: Key) {
        self.held.insert(key);
    }

    pub fn release(&mut self, key: Key) {
        self.held.remove(&key);
    }

    /// Earliest-published live message for (name, correlation key) that is
    /// not held, not expired, and not excluded by the asking subscription.
    pub fn first_matchable(
        &self,
        name: &str,
        correlation_key: &str,
        now: Timestamp,
        excluded: &BTreeSet<Key>,
    ) -> Option<&MessageRecord> {
        let keys = self
            .buffered
            .get(&(name.to_string(), correlation_key.to_string()))?;
        keys.iter()
            .filter(|k| !self.held.contains(k) && !excluded.contains(k))
            .filter_map(|k| self.by_key.get(k))
            .find(|m| now < m.deadline_ms)
    }

    /// All live, unheld, unexpired messages with this name across every
    /// correlation key, in publish order. Used when a start-event
    /// subscription is registered after messages were buffered.
    pub fn matchable_for_name(&self, name: &str, now: Timestamp) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .buffered
            .range((name.to_string(), String::new())..)
            .take_while(|((n, _), _)| n == name)
            .flat_map(|(_, set)| set.iter().copied())
            .filter(|k| {
                !self.held.contains(k)
                    && self.by_key.get(k).is_some_and(|m| now < m.deadline_ms)
            })
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Message keys whose deadline has passed, oldest deadline first.
    pub fn due_for_expiry(&self, now: Timestamp) -> Vec<Key> {
        self.deadlines
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, key)| *key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
