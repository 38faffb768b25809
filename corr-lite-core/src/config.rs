use serde::{Deserialize, Serialize};

/// Engine tuning. One instance shared by every partition so routing and
/// timeout decisions agree cluster-wide.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Fixed number of partitions; correlation keys hash onto this range.
    pub partition_count: u32,
    /// Cadence of the per-partition expiry/retry sweep.
    pub scheduler_interval_ms: i64,
    /// How long a subscription may sit in correlating before the sweep
    /// presumes the correlate command (or its acknowledgement) lost and
    /// re-sends it.
    pub correlate_timeout_ms: i64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            partition_count: 1,
            scheduler_interval_ms: 60_000,
            correlate_timeout_ms: 10_000,
        }
    }
}
