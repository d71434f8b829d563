//! Cross-partition command distribution.
//!
//! A command accepted on one partition (the origin) is replicated to a set
//! of target partitions. The origin tracks every target through
//! CommandDistribution events:
//!
//! ```text
//! per target:  ENQUEUED -> DISTRIBUTING -> ACKNOWLEDGED
//! overall:     STARTED ---------------------------------> FINISHED
//! ```
//!
//! Distributions that share a queue reach each target in enqueue order.
//! Targets apply the command idempotently and answer with ACKNOWLEDGE; the
//! origin re-sends unacknowledged commands on a timer.

pub mod acknowledge;
pub(crate) mod behavior;
pub mod queue;
pub mod record;
pub mod redistributor;
pub mod state;

use serde::Deserialize;

pub use acknowledge::CommandDistributionAcknowledgeProcessor;
pub use behavior::DistributionRequest;
pub use queue::DistributionQueue;
pub use record::CommandDistributionRecord;
pub use redistributor::CommandRedistributor;
pub use state::{DistributionState, TargetState};

/// Default interval between redistribution cycles.
pub const DEFAULT_REDISTRIBUTION_INTERVAL_MS: u64 = 10_000;

/// Default upper bound of a target's redistribution backoff.
pub const DEFAULT_MAX_REDISTRIBUTION_INTERVAL_MS: u64 = 300_000;

/// Redistribution timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    pub redistribution_interval_ms: u64,
    pub max_redistribution_interval_ms: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            redistribution_interval_ms: DEFAULT_REDISTRIBUTION_INTERVAL_MS,
            max_redistribution_interval_ms: DEFAULT_MAX_REDISTRIBUTION_INTERVAL_MS,
        }
    }
}
