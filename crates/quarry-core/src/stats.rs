use serde::Serialize;

/// Aggregate progress counters for one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub errors: u64,
    pub cache_hits: u64,
}

/// Receives periodic [`Statistics`] snapshots (decoupled progress
/// reporting).
pub trait StatsSink: Send + Sync {
    fn publish(&self, stats: &Statistics);
}

/// Sink that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatsSink;

impl StatsSink for TracingStatsSink {
    fn publish(&self, stats: &Statistics) {
        tracing::info!(
            queued = stats.queued,
            running = stats.running,
            completed = stats.completed,
            errors = stats.errors,
            cache_hits = stats.cache_hits,
            "progress"
        );
    }
}
