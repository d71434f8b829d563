//! Redelivery of unacknowledged distributions.
//!
//! Runs on the partition's logical clock. Every `redistribution_interval`
//! it re-sends DISTRIBUTE for each target still in DISTRIBUTING whose last
//! send is older than that target's backoff. The backoff starts at the
//! interval and doubles per retry up to `max_redistribution_interval`.
//!
//! Only DISTRIBUTING targets are retried: an ENQUEUED distribution waits
//! for its predecessor, so redelivery never overtakes queue order.
//! Bookkeeping for acknowledged targets is dropped at the next cycle.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::record::PartitionId;
use crate::transport::InterPartitionMessage;

use super::behavior::distribute_message;
use super::state::{DistributionState, TargetState};
use super::DistributionConfig;

#[derive(Debug, Clone, Copy)]
struct RetryState {
    last_sent_millis: Option<i64>,
    backoff_millis: i64,
}

/// Retry timers for one origin partition.
#[derive(Debug)]
pub struct CommandRedistributor {
    partition_id: PartitionId,
    interval_millis: i64,
    max_interval_millis: i64,
    retries: HashMap<(i64, PartitionId), RetryState>,
    last_cycle_millis: Option<i64>,
}

impl CommandRedistributor {
    pub fn new(partition_id: PartitionId, config: &DistributionConfig) -> Self {
        let interval_millis = config.redistribution_interval_ms as i64;
        Self {
            partition_id,
            interval_millis,
            max_interval_millis: (config.max_redistribution_interval_ms as i64)
                .max(interval_millis),
            retries: HashMap::new(),
            last_cycle_millis: None,
        }
    }

    /// Note that a DISTRIBUTE was just sent outside a retry cycle.
    pub fn record_send(&mut self, key: i64, target: PartitionId, now_millis: i64) {
        let interval = self.interval_millis;
        self.retries
            .entry((key, target))
            .and_modify(|retry| retry.last_sent_millis = Some(now_millis))
            .or_insert(RetryState {
                last_sent_millis: Some(now_millis),
                backoff_millis: interval,
            });
    }

    /// Whether a retry cycle should run now.
    pub fn is_due(&self, now_millis: i64) -> bool {
        match self.last_cycle_millis {
            None => true,
            Some(last) => now_millis - last >= self.interval_millis,
        }
    }

    /// Run one cycle, returning the messages to re-send.
    pub fn run_retry_cycle(
        &mut self,
        state: &DistributionState,
        now_millis: i64,
    ) -> Vec<(PartitionId, InterPartitionMessage)> {
        self.last_cycle_millis = Some(now_millis);
        self.retries.retain(|(key, target), _| {
            state.pending_state(*key, *target) == Some(TargetState::Distributing)
        });

        let mut messages = Vec::new();
        for (key, target) in state.distributing() {
            let retry = self.retries.entry((key, target)).or_insert(RetryState {
                last_sent_millis: None,
                backoff_millis: self.interval_millis,
            });
            let due = match retry.last_sent_millis {
                None => true,
                Some(last) => now_millis - last >= retry.backoff_millis,
            };
            if !due {
                continue;
            }

            let message = state
                .distribution(key)
                .and_then(|record| {
                    distribute_message(key, &record.for_partition(target), self.partition_id)
                });
            let Some(message) = message else {
                warn!(key, target, "Cannot redistribute: distribution record is incomplete");
                continue;
            };

            if retry.last_sent_millis.is_some() {
                retry.backoff_millis = (retry.backoff_millis * 2).min(self.max_interval_millis);
            }
            retry.last_sent_millis = Some(now_millis);
            debug!(
                key,
                target,
                next_backoff_ms = retry.backoff_millis,
                "Redistributing command"
            );
            messages.push((target, message));
        }
        messages
    }

    /// Number of `(key, target)` pairs with retry bookkeeping.
    pub fn tracked(&self) -> usize {
        self.retries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::CommandDistributionRecord;
    use crate::record::{CommandDistributionIntent, GroupIntent, ValueType};

    fn config() -> DistributionConfig {
        DistributionConfig {
            redistribution_interval_ms: 10_000,
            max_redistribution_interval_ms: 30_000,
        }
    }

    fn distributing_state(key: i64, target: PartitionId) -> DistributionState {
        let record = CommandDistributionRecord {
            partition_id: 1,
            queue_id: None,
            value_type: Some(ValueType::Group),
            intent: Some(GroupIntent::Create.into()),
            command_value: Some(serde_json::json!({"name": "ops"})),
        };
        let mut state = DistributionState::default();
        state.apply(key, CommandDistributionIntent::Started, record.clone());
        state.apply(
            key,
            CommandDistributionIntent::Distributing,
            record.for_partition(target),
        );
        state
    }

    #[test]
    fn test_recent_send_is_not_retried() {
        let state = distributing_state(7, 2);
        let mut redistributor = CommandRedistributor::new(1, &config());
        redistributor.record_send(7, 2, 0);

        assert!(redistributor.run_retry_cycle(&state, 5_000).is_empty());
        assert_eq!(redistributor.run_retry_cycle(&state, 10_000).len(), 1);
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let state = distributing_state(7, 2);
        let mut redistributor = CommandRedistributor::new(1, &config());
        redistributor.record_send(7, 2, 0);

        assert_eq!(redistributor.run_retry_cycle(&state, 10_000).len(), 1);
        // backoff is now 20s
        assert!(redistributor.run_retry_cycle(&state, 25_000).is_empty());
        assert_eq!(redistributor.run_retry_cycle(&state, 30_000).len(), 1);
        // backoff capped at 30s
        assert!(redistributor.run_retry_cycle(&state, 55_000).is_empty());
        assert_eq!(redistributor.run_retry_cycle(&state, 60_000).len(), 1);
    }

    #[test]
    fn test_unsent_distribution_is_sent_immediately() {
        let state = distributing_state(7, 3);
        let mut redistributor = CommandRedistributor::new(1, &config());

        let messages = redistributor.run_retry_cycle(&state, 0);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 3);
        assert!(matches!(
            messages[0].1,
            InterPartitionMessage::Distribute {
                distribution_key: 7,
                origin_partition: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_acknowledged_targets_are_forgotten() {
        let mut state = distributing_state(7, 2);
        let mut redistributor = CommandRedistributor::new(1, &config());
        redistributor.record_send(7, 2, 0);
        assert_eq!(redistributor.tracked(), 1);

        state.apply(
            7,
            CommandDistributionIntent::Acknowledged,
            CommandDistributionRecord {
                partition_id: 2,
                ..Default::default()
            },
        );
        assert!(redistributor.run_retry_cycle(&state, 60_000).is_empty());
        assert_eq!(redistributor.tracked(), 0);
    }

    #[test]
    fn test_cycle_due_once_per_interval() {
        let mut redistributor = CommandRedistributor::new(1, &config());
        assert!(redistributor.is_due(0));
        redistributor.run_retry_cycle(&DistributionState::default(), 0);
        assert!(!redistributor.is_due(9_999));
        assert!(redistributor.is_due(10_000));
    }
}
