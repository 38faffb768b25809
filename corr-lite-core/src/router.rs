use crate::types::PartitionId;
use sha2::{Digest, Sha256};

/// Route a correlation key to its owning partition.
///
/// Publishers and subscription openers run on different partitions but must
/// resolve the same correlation key to the same partition, across restarts
/// and across releases — so this is a fixed SHA-256 reduction, not a runtime
/// hasher with randomized state.
pub fn partition_for(correlation_key: &str, partition_count: u32) -> PartitionId {
    assert!(partition_count > 0, "partition_count must be positive");
    let digest = Sha256::digest(correlation_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partition_count)) as PartitionId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_deterministic() {
        for key in ["order-123", "order-124", "", "日本"] {
            assert_eq!(partition_for(key, 8), partition_for(key, 8));
        }
    }

    #[test]
    fn routing_stays_in_range() {
        for i in 0..1000 {
            let key = format!("key-{i}");
            assert!(partition_for(&key, 3) < 3);
        }
    }

    #[test]
    fn single_partition_takes_everything() {
        assert_eq!(partition_for("anything", 1), 0);
    }

    #[test]
    fn distinct_keys_spread_across_partitions() {
        let hits: std::collections::BTreeSet<_> =
            (0..100).map(|i| partition_for(&format!("k{i}"), 4)).collect();
        assert_eq!(hits.len(), 4, "100 keys should hit all 4 partitions");
    }
}
