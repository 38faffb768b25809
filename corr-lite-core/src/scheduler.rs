use crate::correlation::CorrelationProcessor;
use crate::instance::InstanceProcessor;
use crate::types::Timestamp;
use anyhow::Result;
use tracing::debug;

/// Result of one scheduler sweep, mostly for observability and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub resent: usize,
}

/// Per-partition self-healing loop. Runs on a fixed interval: first reclaim
/// messages past their deadline, then re-send correlate commands presumed
/// lost, then re-send unconfirmed mirror opens and closes. Never blocks and
/// never waits on delivery — loss is recovered on the next interval.
pub struct CorrelationScheduler {
    interval_ms: i64,
    next_due: Timestamp,
}

impl CorrelationScheduler {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            next_due: interval_ms,
        }
    }

    /// Run the sweep if the interval elapsed; otherwise a cheap no-op.
    pub async fn on_tick(
        &mut self,
        now: Timestamp,
        correlation: &mut CorrelationProcessor,
        instance: &mut InstanceProcessor,
    ) -> Result<SweepStats> {
        if now < self.next_due {
            return Ok(SweepStats::default());
        }
        self.next_due = now + self.interval_ms;

        // Expiry first: a stuck correlate for an expired message should not
        // be re-sent with the message still counted as live.
        let expired = correlation.expire_due(now).await?;
        let resent = correlation.resend_stuck(now).await? + instance.resend_pending(now).await?;
        let stats = SweepStats { expired, resent };
        if stats != SweepStats::default() {
            debug!(?stats, "scheduler sweep");
        }
        Ok(stats)
    }
}
