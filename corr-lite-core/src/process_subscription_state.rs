use crate::types::*;
use std::collections::BTreeMap;

/// Instance-side mirror store. Owned by the instance partition's processor;
/// the correlation partition never touches it directly.
#[derive(Default)]
pub struct ProcessSubscriptionState {
    /// (element instance key, message name) → mirror record.
    by_element: BTreeMap<(Key, String), ProcessMessageSubscriptionRecord>,
    /// (process definition key, message key) → created instance key.
    /// Makes start-event correlation idempotent: a re-delivered correlate
    /// re-acks the already created instance instead of creating another.
    start_instances: BTreeMap<(Key, Key), Key>,
}

impl ProcessSubscriptionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, element_instance_key: Key, name: &str) -> bool {
        self.by_element
            .contains_key(&(element_instance_key, name.to_string()))
    }

    pub fn put(&mut self, record: ProcessMessageSubscriptionRecord) {
        self.by_element.insert(
            (record.element_instance_key, record.message_name.clone()),
            record,
        );
    }

    pub fn get(&self, element_instance_key: Key, name: &str) -> Option<&ProcessMessageSubscriptionRecord> {
        self.by_element
            .get(&(element_instance_key, name.to_string()))
    }

    pub fn get_mut(
        &mut self,
        element_instance_key: Key,
        name: &str,
    ) -> Option<&mut ProcessMessageSubscriptionRecord> {
        self.by_element
            .get_mut(&(element_instance_key, name.to_string()))
    }

    pub fn remove(&mut self, element_instance_key: Key, name: &str) -> Option<ProcessMessageSubscriptionRecord> {
        self.by_element
            .remove(&(element_instance_key, name.to_string()))
    }

    /// Mirrors whose open or close request has been unconfirmed since before
    /// `cutoff`, as (element instance key, message name) pairs.
    pub fn pending_since(&self, cutoff: Timestamp) -> Vec<(Key, String)> {
        self.by_element
            .values()
            .filter(|r| match r.lifecycle {
                MirrorLifecycle::Opening { sent_at } | MirrorLifecycle::Closing { sent_at } => {
                    sent_at <= cutoff
                }
                MirrorLifecycle::Open => false,
            })
            .map(|r| (r.element_instance_key, r.message_name.clone()))
            .collect()
    }

    pub fn record_start_instance(&mut self, process_definition_key: Key, message_key: Key, instance_key: Key) {
        self.start_instances
            .insert((process_definition_key, message_key), instance_key);
    }

    pub fn start_instance_for(&self, process_definition_key: Key, message_key: Key) -> Option<Key> {
        self.start_instances
            .get(&(process_definition_key, message_key))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn mirror(element_instance_key: Key, name: &str, lifecycle: MirrorLifecycle) -> ProcessMessageSubscriptionRecord {
        ProcessMessageSubscriptionRecord {
            process_instance_key: 1,
            element_instance_key,
            message_name: name.into(),
            correlation_key: "k".into(),
            interrupting: true,
            lifecycle,
            correlated_messages: BTreeSet::new(),
        }
    }

    #[test]
    fn mirror_records_are_keyed_by_element_and_name() {
        let mut state = ProcessSubscriptionState::new();
        state.put(mirror(10, "a", MirrorLifecycle::Open));
        assert!(state.exists(10, "a"));
        assert!(!state.exists(10, "b"));
        assert!(state.remove(10, "a").is_some());
        assert!(state.remove(10, "a").is_none());
    }

    #[test]
    fn pending_since_skips_confirmed_mirrors() {
        let mut state = ProcessSubscriptionState::new();
        state.put(mirror(10, "a", MirrorLifecycle::Opening { sent_at: 100 }));
        state.put(mirror(11, "b", MirrorLifecycle::Open));
        state.put(mirror(12, "c", MirrorLifecycle::Closing { sent_at: 500 }));

        let due = state.pending_since(100);
        assert_eq!(due, vec![(10, "a".to_string())]);
        let due = state.pending_since(1_000);
        assert_eq!(due, vec![(10, "a".to_string()), (12, "c".to_string())]);
    }

    #[test]
    fn start_instance_dedup_by_definition_and_message() {
        let mut state = ProcessSubscriptionState::new();
        state.record_start_instance(5, 100, 777);
        assert_eq!(state.start_instance_for(5, 100), Some(777));
        assert_eq!(state.start_instance_for(5, 101), None);
    }
}
