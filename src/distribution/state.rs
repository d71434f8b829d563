//! Distribution bookkeeping, derived purely from CommandDistribution
//! events.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::record::{CommandDistributionIntent, PartitionId};

use super::record::CommandDistributionRecord;

/// Per-target progress of a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Waiting behind an earlier distribution in the same queue.
    Enqueued,
    /// Sent (or due to be sent) and awaiting acknowledgement.
    Distributing,
}

#[derive(Debug, Clone, PartialEq)]
struct PendingTarget {
    state: TargetState,
    queue_id: Option<String>,
}

/// Prior value of one slot, restored on rollback.
#[derive(Debug, Clone)]
enum DistributionUndo {
    Distribution(i64, Option<CommandDistributionRecord>),
    Pending((i64, PartitionId), Option<PendingTarget>),
    QueuePushed((String, PartitionId)),
    QueueRemoved((String, PartitionId), usize, i64),
}

/// Open distributions of one partition.
#[derive(Debug, Clone, Default)]
pub struct DistributionState {
    /// STARTED record per distribution key.
    distributions: HashMap<i64, CommandDistributionRecord>,
    pending: BTreeMap<(i64, PartitionId), PendingTarget>,
    queues: HashMap<(String, PartitionId), VecDeque<i64>>,
    journal: Option<Vec<DistributionUndo>>,
}

impl DistributionState {
    /// Apply a CommandDistribution event.
    pub fn apply(
        &mut self,
        key: i64,
        intent: CommandDistributionIntent,
        record: CommandDistributionRecord,
    ) {
        let slot = (key, record.partition_id);
        match intent {
            CommandDistributionIntent::Started => {
                self.put_distribution(key, Some(record));
            }
            CommandDistributionIntent::Enqueued => {
                if let Some(queue_id) = &record.queue_id {
                    let queue_slot = (queue_id.clone(), record.partition_id);
                    self.queues
                        .entry(queue_slot.clone())
                        .or_default()
                        .push_back(key);
                    self.record(DistributionUndo::QueuePushed(queue_slot));
                }
                self.put_pending(
                    slot,
                    Some(PendingTarget {
                        state: TargetState::Enqueued,
                        queue_id: record.queue_id,
                    }),
                );
            }
            CommandDistributionIntent::Distributing => {
                let queue_id = match self.pending.get(&slot) {
                    Some(target) => target.queue_id.clone(),
                    None => record.queue_id,
                };
                self.put_pending(
                    slot,
                    Some(PendingTarget {
                        state: TargetState::Distributing,
                        queue_id,
                    }),
                );
            }
            CommandDistributionIntent::Acknowledged => {
                let Some(target) = self.put_pending(slot, None) else {
                    return;
                };
                if let Some(queue_id) = target.queue_id {
                    self.remove_from_queue((queue_id, record.partition_id), key);
                }
            }
            CommandDistributionIntent::Finished => {
                self.put_distribution(key, None);
            }
            CommandDistributionIntent::Acknowledge => {}
        }
    }

    fn record(&mut self, undo: DistributionUndo) {
        if let Some(journal) = &mut self.journal {
            journal.push(undo);
        }
    }

    fn put_distribution(&mut self, key: i64, record: Option<CommandDistributionRecord>) {
        let previous = match record {
            Some(record) => self.distributions.insert(key, record),
            None => self.distributions.remove(&key),
        };
        self.record(DistributionUndo::Distribution(key, previous));
    }

    /// Returns the target previously in `slot`.
    fn put_pending(
        &mut self,
        slot: (i64, PartitionId),
        target: Option<PendingTarget>,
    ) -> Option<PendingTarget> {
        let previous = match target {
            Some(target) => self.pending.insert(slot, target),
            None => self.pending.remove(&slot),
        };
        self.record(DistributionUndo::Pending(slot, previous.clone()));
        previous
    }

    fn remove_from_queue(&mut self, queue_slot: (String, PartitionId), key: i64) {
        let Some(queue) = self.queues.get_mut(&queue_slot) else {
            return;
        };
        let removed = queue.iter().position(|k| *k == key);
        if let Some(index) = removed {
            queue.remove(index);
        }
        if queue.is_empty() {
            self.queues.remove(&queue_slot);
        }
        if let Some(index) = removed {
            self.record(DistributionUndo::QueueRemoved(queue_slot, index, key));
        }
    }

    /// Start recording changes so they can be undone.
    pub(crate) fn checkpoint(&mut self) {
        self.journal = Some(Vec::new());
    }

    pub(crate) fn release_checkpoint(&mut self) {
        self.journal = None;
    }

    /// Undo every change since `checkpoint`.
    pub(crate) fn restore_checkpoint(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for undo in journal.into_iter().rev() {
            match undo {
                DistributionUndo::Distribution(key, previous) => {
                    self.put_distribution(key, previous);
                }
                DistributionUndo::Pending(slot, previous) => {
                    self.put_pending(slot, previous);
                }
                DistributionUndo::QueuePushed(queue_slot) => {
                    if let Some(queue) = self.queues.get_mut(&queue_slot) {
                        queue.pop_back();
                        if queue.is_empty() {
                            self.queues.remove(&queue_slot);
                        }
                    }
                }
                DistributionUndo::QueueRemoved(queue_slot, index, key) => {
                    let queue = self.queues.entry(queue_slot).or_default();
                    queue.insert(index.min(queue.len()), key);
                }
            }
        }
    }

    /// STARTED record of an open distribution.
    pub fn distribution(&self, key: i64) -> Option<&CommandDistributionRecord> {
        self.distributions.get(&key)
    }

    pub fn pending_state(&self, key: i64, partition_id: PartitionId) -> Option<TargetState> {
        self.pending
            .get(&(key, partition_id))
            .map(|target| target.state)
    }

    /// Whether any target has not acknowledged yet.
    pub fn has_pending(&self, key: i64) -> bool {
        self.pending_targets(key).next().is_some()
    }

    pub fn pending_targets(&self, key: i64) -> impl Iterator<Item = PartitionId> + '_ {
        self.pending
            .range((key, PartitionId::MIN)..=(key, PartitionId::MAX))
            .map(|((_, partition_id), _)| *partition_id)
    }

    /// Oldest unacknowledged distribution of a queue for a target.
    pub fn queue_head(&self, queue_id: &str, partition_id: PartitionId) -> Option<i64> {
        self.queues
            .get(&(queue_id.to_string(), partition_id))
            .and_then(|queue| queue.front().copied())
    }

    /// Every `(key, target)` awaiting acknowledgement of a sent command.
    pub fn distributing(&self) -> impl Iterator<Item = (i64, PartitionId)> + '_ {
        self.pending
            .iter()
            .filter(|(_, target)| target.state == TargetState::Distributing)
            .map(|(slot, _)| *slot)
    }

    pub fn open_distributions(&self) -> usize {
        self.distributions.len()
    }
}
