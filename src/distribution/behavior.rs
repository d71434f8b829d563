//! Origin- and target-side distribution steps, run inside a processor.

use tracing::debug;

use crate::engine::{ProcessingContext, ProcessingResult};
use crate::record::{CommandDistributionIntent, PartitionId, RecordValue, TypedRecord, NO_POSITION};
use crate::transport::InterPartitionMessage;

use super::record::CommandDistributionRecord;
use super::state::TargetState;

/// Builder returned by `ProcessingContext::distribution`.
///
/// ```ignore
/// ctx.distribution()
///     .with_key(key)
///     .in_queue(DistributionQueue::Identity)
///     .distribute(&command)?;
/// ```
pub struct DistributionRequest<'c, 'a> {
    ctx: &'c mut ProcessingContext<'a>,
    key: Option<i64>,
    queue_id: Option<String>,
    partitions: Option<Vec<PartitionId>>,
}

impl<'c, 'a> DistributionRequest<'c, 'a> {
    pub(crate) fn new(ctx: &'c mut ProcessingContext<'a>) -> Self {
        Self {
            ctx,
            key: None,
            queue_id: None,
            partitions: None,
        }
    }

    /// Distribution key. Defaults to the command's key, or a new key.
    pub fn with_key(mut self, key: i64) -> Self {
        self.key = Some(key);
        self
    }

    /// Deliver in order with other distributions of the same queue.
    pub fn in_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    /// Restrict the targets. Defaults to every other partition.
    pub fn for_partitions(mut self, partitions: Vec<PartitionId>) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Record STARTED and hand the command to every target: ENQUEUED when
    /// queued, then DISTRIBUTING plus a DISTRIBUTE message once it is at the
    /// head of its queue.
    pub fn distribute<T: RecordValue>(self, command: &TypedRecord<T>) -> ProcessingResult {
        let DistributionRequest {
            ctx,
            key,
            queue_id,
            partitions,
        } = self;

        let origin = ctx.partition_id();
        let targets: Vec<PartitionId> = partitions
            .unwrap_or_else(|| ctx.other_partitions())
            .into_iter()
            .filter(|p| *p != origin)
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let key = match key {
            Some(key) => key,
            None if command.key != NO_POSITION => command.key,
            None => ctx.next_key(),
        };

        let started = CommandDistributionRecord {
            partition_id: origin,
            queue_id: queue_id.clone(),
            value_type: Some(T::VALUE_TYPE),
            intent: Some(command.intent),
            command_value: Some(serde_json::to_value(&command.value)?),
        };
        ctx.append_event(key, CommandDistributionIntent::Started, &started)?;

        for target in targets {
            let record = started.for_partition(target);
            match &queue_id {
                Some(queue_id) => {
                    ctx.append_event(key, CommandDistributionIntent::Enqueued, &record)?;
                    if ctx.state().distribution.queue_head(queue_id, target) == Some(key) {
                        start_distributing(ctx, key, &record)?;
                    } else {
                        debug!(key, target, queue_id = %queue_id, "Distribution queued");
                    }
                }
                None => start_distributing(ctx, key, &record)?,
            }
        }
        Ok(())
    }
}

/// Append DISTRIBUTING for one target and send the command to it.
pub(crate) fn start_distributing(
    ctx: &mut ProcessingContext<'_>,
    key: i64,
    record: &CommandDistributionRecord,
) -> ProcessingResult {
    ctx.append_event(key, CommandDistributionIntent::Distributing, record)?;
    if let Some(message) = distribute_message(key, record, ctx.partition_id()) {
        ctx.send(record.partition_id, message);
    }
    Ok(())
}

/// DISTRIBUTE message for a per-target distribution record.
pub(crate) fn distribute_message(
    key: i64,
    record: &CommandDistributionRecord,
    origin_partition: PartitionId,
) -> Option<InterPartitionMessage> {
    Some(InterPartitionMessage::Distribute {
        distribution_key: key,
        queue_id: record.queue_id.clone(),
        value_type: record.value_type?,
        intent: record.intent?,
        payload: record.command_value.clone()?,
        origin_partition,
    })
}

/// Target side: acknowledge a distributed command to its origin.
pub(crate) fn acknowledge_command(
    ctx: &mut ProcessingContext<'_>,
    distribution_key: i64,
    origin_partition: PartitionId,
) {
    let target_partition = ctx.partition_id();
    ctx.send(
        origin_partition,
        InterPartitionMessage::Acknowledge {
            distribution_key,
            target_partition,
        },
    );
}

/// Origin side: after `target` acknowledged `key`, release the next
/// distribution waiting in the same queue for that target.
pub(crate) fn continue_queue(
    ctx: &mut ProcessingContext<'_>,
    queue_id: &str,
    target: PartitionId,
) -> ProcessingResult {
    let state = &ctx.state().distribution;
    let Some(next) = state.queue_head(queue_id, target) else {
        return Ok(());
    };
    if state.pending_state(next, target) != Some(TargetState::Enqueued) {
        return Ok(());
    }
    let Some(record) = state.distribution(next).map(|r| r.for_partition(target)) else {
        return Ok(());
    };
    debug!(key = next, target, queue_id, "Releasing next queued distribution");
    start_distributing(ctx, next, &record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::distribution::DistributionQueue;
    use crate::engine::EngineState;
    use crate::identity::GroupRecord;
    use crate::record::{GroupIntent, Intent, LogEntry, RecordMetadata, RecordType, ValueType};

    fn create_command(key: i64, name: &str) -> LogEntry {
        LogEntry {
            position: 1,
            source_position: NO_POSITION,
            key,
            record_type: RecordType::Command,
            value_type: ValueType::Group,
            intent: GroupIntent::Create.into(),
            metadata: RecordMetadata::default(),
            payload: Bytes::from(serde_json::to_vec(&GroupRecord::named(name)).unwrap()),
        }
    }

    fn distribute(
        state: &mut EngineState,
        entry: &LogEntry,
        queue: Option<DistributionQueue>,
        partitions: Option<Vec<PartitionId>>,
    ) -> crate::engine::ProcessingOutput {
        let typed = TypedRecord::<GroupRecord>::from_entry(entry).unwrap();
        let mut ctx = ProcessingContext::new(1, 4, state, entry);
        let mut request = ctx.distribution();
        if let Some(queue) = queue {
            request = request.in_queue(queue);
        }
        if let Some(partitions) = partitions {
            request = request.for_partitions(partitions);
        }
        request.distribute(&typed).unwrap();
        ctx.finish()
    }

    #[test]
    fn test_unqueued_distribution_to_selected_partitions() {
        let mut state = EngineState::new(1);
        let entry = create_command(NO_POSITION, "ops");

        let output = distribute(&mut state, &entry, None, Some(vec![1, 3]));

        let intents: Vec<Intent> = output.records.iter().map(|r| r.intent).collect();
        assert_eq!(
            intents,
            vec![
                CommandDistributionIntent::Started.into(),
                CommandDistributionIntent::Distributing.into(),
            ]
        );
        let receivers: Vec<PartitionId> = output.sends.iter().map(|(p, _)| *p).collect();
        assert_eq!(receivers, vec![3]);

        let key = output.records[0].key;
        assert_eq!(
            state.distribution.pending_state(key, 3),
            Some(TargetState::Distributing)
        );
        assert_eq!(state.distribution.pending_state(key, 2), None);
    }

    #[test]
    fn test_second_queued_distribution_waits_for_head() {
        let mut state = EngineState::new(1);
        let first = create_command(10, "ops");
        let second = create_command(11, "dev");

        let queue = Some(DistributionQueue::Identity);
        let first_output = distribute(&mut state, &first, queue, None);
        let second_output = distribute(&mut state, &second, queue, None);

        assert_eq!(first_output.sends.len(), 3);
        assert!(second_output.sends.is_empty());
        assert!(second_output
            .records
            .iter()
            .all(|r| r.intent != CommandDistributionIntent::Distributing.into()));
        for target in [2, 3, 4] {
            assert_eq!(
                state.distribution.pending_state(11, target),
                Some(TargetState::Enqueued)
            );
            assert_eq!(
                state.distribution.queue_head(DistributionQueue::Identity.queue_id(), target),
                Some(10)
            );
        }
    }

    #[test]
    fn test_no_targets_records_nothing() {
        let mut state = EngineState::new(1);
        let entry = create_command(NO_POSITION, "ops");

        let output = distribute(&mut state, &entry, None, Some(vec![1]));

        assert!(output.records.is_empty());
        assert!(output.sends.is_empty());
        assert_eq!(state.distribution.open_distributions(), 0);
    }
}
