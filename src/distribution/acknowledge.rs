//! Origin-side handling of ACKNOWLEDGE commands.

use tracing::debug;

use crate::engine::{CommandProcessor, ProcessingContext, ProcessingError, ProcessingResult};
use crate::record::{CommandDistributionIntent, RejectionType, TypedRecord};

use super::behavior::continue_queue;
use super::record::CommandDistributionRecord;
use super::state::TargetState;

/// Marks a target as acknowledged, releases the next queued distribution
/// for that target and finishes the distribution once no target is left.
#[derive(Debug, Default)]
pub struct CommandDistributionAcknowledgeProcessor;

impl CommandProcessor for CommandDistributionAcknowledgeProcessor {
    type Value = CommandDistributionRecord;

    fn process_command(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &TypedRecord<CommandDistributionRecord>,
    ) -> ProcessingResult {
        let key = command.key;
        let target = command.value.partition_id;
        let distribution = &ctx.state().distribution;

        match distribution.pending_state(key, target) {
            Some(TargetState::Distributing) => {}
            Some(TargetState::Enqueued) => {
                return Err(ProcessingError::rejected(
                    RejectionType::InvalidState,
                    format!(
                        "Expected to acknowledge distribution {} for partition {}, but it was not sent yet",
                        key, target
                    ),
                ));
            }
            None => {
                return Err(ProcessingError::rejected(
                    RejectionType::NotFound,
                    format!(
                        "Expected to acknowledge distribution {} for partition {}, but no such distribution is pending",
                        key, target
                    ),
                ));
            }
        }
        let Some(started) = distribution.distribution(key).cloned() else {
            return Err(ProcessingError::Unexpected(format!(
                "distribution {} is pending for partition {} but was never started",
                key, target
            )));
        };

        ctx.append_event(
            key,
            CommandDistributionIntent::Acknowledged,
            &started.for_partition(target),
        )?;
        debug!(key, target, "Distribution acknowledged");

        if let Some(queue_id) = &started.queue_id {
            continue_queue(ctx, queue_id, target)?;
        }

        if !ctx.state().distribution.has_pending(key) {
            let origin = ctx.partition_id();
            ctx.append_event(
                key,
                CommandDistributionIntent::Finished,
                &started.for_partition(origin),
            )?;
            debug!(key, "Distribution finished");
        }
        Ok(())
    }
}
