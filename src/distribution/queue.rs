//! Distribution queues.
//!
//! Distributions enqueued on the same queue for the same target partition
//! are delivered one at a time, in enqueue order.

use std::fmt;

/// Well-known queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributionQueue {
    Identity,
    Deployment,
    Redistribution,
}

impl DistributionQueue {
    pub fn queue_id(self) -> &'static str {
        match self {
            DistributionQueue::Identity => "IDENTITY",
            DistributionQueue::Deployment => "DEPLOYMENT",
            DistributionQueue::Redistribution => "REDISTRIBUTION",
        }
    }
}

impl fmt::Display for DistributionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_id())
    }
}

impl From<DistributionQueue> for String {
    fn from(queue: DistributionQueue) -> Self {
        queue.queue_id().to_string()
    }
}
