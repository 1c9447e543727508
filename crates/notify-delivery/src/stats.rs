//! Pipeline counters shared by the use cases and loops.

use std::sync::Arc;

use tokio::sync::RwLock;

/// Statistics for pipeline monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Number of running loops.
    pub active_workers: usize,
    /// Channel send attempts.
    pub send_attempts: u64,
    /// Notifications delivered.
    pub sent: u64,
    /// Failures that scheduled a retry.
    pub retries_scheduled: u64,
    /// Notifications moved to the dead-letter state.
    pub dead_lettered: u64,
    /// Outbox events published.
    pub outbox_published: u64,
    /// Outbox publish attempts that failed.
    pub outbox_publish_failures: u64,
    /// Undecodable records routed to the dlq topic.
    pub parse_errors: u64,
    /// Published outbox events deleted by retention.
    pub outbox_events_pruned: u64,
    /// Consumed bus records deleted by retention.
    pub bus_records_pruned: u64,
}

/// Handle to the counters, cloned into every component that updates them.
pub type SharedStats = Arc<RwLock<PipelineStats>>;

/// Creates a zeroed counter set.
pub fn shared() -> SharedStats {
    Arc::new(RwLock::new(PipelineStats::default()))
}
