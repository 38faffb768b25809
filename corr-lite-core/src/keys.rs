use crate::types::{Key, PartitionId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Bits reserved for the per-partition counter. The partition id lives in the
/// bits above, so any key reveals its owning partition without a lookup —
/// which is how the correlation partition knows where to send a correlate
/// command for a given process instance key.
const COUNTER_BITS: u32 = 51;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Unique, monotonic key generator scoped to one partition.
pub struct KeyGenerator {
    partition: PartitionId,
    counter: AtomicU64,
}

impl KeyGenerator {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_key(&self) -> Key {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert!(n <= COUNTER_MASK);
        (u64::from(self.partition) << COUNTER_BITS) | n
    }
}

/// Recover the owning partition from any engine-assigned key.
pub fn partition_of(key: Key) -> PartitionId {
    (key >> COUNTER_BITS) as PartitionId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_monotonic_within_a_partition() {
        let gen = KeyGenerator::new(3);
        let a = gen.next_key();
        let b = gen.next_key();
        assert!(b > a);
        assert_eq!(partition_of(a), 3);
        assert_eq!(partition_of(b), 3);
    }

    #[test]
    fn partitions_never_collide() {
        let p0 = KeyGenerator::new(0);
        let p1 = KeyGenerator::new(1);
        assert_ne!(p0.next_key(), p1.next_key());
    }

    #[test]
    fn partition_zero_keys_start_at_one() {
        // Key 0 is reserved as "no key".
        assert_eq!(KeyGenerator::new(0).next_key(), 1);
    }
}
