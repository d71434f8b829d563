//! Single-threaded command processing for one partition.
//!
//! Reads committed commands from the log, dispatches each to its processor
//! and writes the resulting records as one batch whose source position is
//! the command. Messages produced by a command are sent only after that
//! batch was accepted by the log.
//!
//! On open, the log is replayed: events rebuild state and the highest
//! source position seen marks the last processed command. Commands after
//! it are processed again.

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::distribution::{CommandDistributionRecord, CommandRedistributor, DistributionConfig};
use crate::logstream::{LogStreamReader, Sequencer, WriteContext, WriteFailure};
use crate::record::{
    CommandDistributionIntent, DistributionMetadata, LogAppendEntry, LogEntry, PartitionId,
    RecordMetadata, RecordRejection, RecordType, RejectionType, NO_POSITION,
};
use crate::transport::{InterPartitionMessage, InterPartitionTransport};

#[cfg(feature = "otel")]
use crate::utils::metrics::{partition_attr, DISTRIBUTION_RETRY_TOTAL, DISTRIBUTION_SENT_TOTAL};

use super::context::{CommandResponse, ProcessingContext, ProcessingOutput};
use super::processor::ProcessingError;
use super::registry::ProcessorRegistry;
use super::response::ResponseStore;
use super::state::EngineState;
use super::EngineError;

/// Dependencies of a stream processor.
pub struct StreamProcessorContext {
    pub partition_id: PartitionId,
    pub partition_count: u32,
    pub writer: Arc<Sequencer>,
    pub registry: ProcessorRegistry,
    pub transport: Arc<dyn InterPartitionTransport>,
    pub clock: Arc<dyn Clock>,
    pub distribution: DistributionConfig,
}

/// Processes one partition's commands.
pub struct StreamProcessor {
    partition_id: PartitionId,
    partition_count: u32,
    writer: Arc<Sequencer>,
    reader: LogStreamReader,
    state: EngineState,
    registry: ProcessorRegistry,
    transport: Arc<dyn InterPartitionTransport>,
    redistributor: CommandRedistributor,
    clock: Arc<dyn Clock>,
    last_processed_position: i64,
    responses: ResponseStore,
}

impl StreamProcessor {
    /// Replay the log from `replay_reader` and position `reader` after the
    /// last processed command.
    pub fn recover(
        context: StreamProcessorContext,
        mut replay_reader: LogStreamReader,
        mut reader: LogStreamReader,
    ) -> Result<Self, EngineError> {
        let StreamProcessorContext {
            partition_id,
            partition_count,
            writer,
            registry,
            transport,
            clock,
            distribution,
        } = context;

        let mut state = EngineState::new(partition_id);
        let mut last_processed_position = NO_POSITION;
        let mut replayed = 0usize;
        for entry in replay_reader.by_ref() {
            let entry = entry?;
            if entry.is_command() {
                continue;
            }
            last_processed_position = last_processed_position.max(entry.source_position);
            if entry.is_event() {
                state.apply_event(entry.key, entry.value_type, entry.intent, &entry.payload)?;
                replayed += 1;
            }
        }

        if last_processed_position == NO_POSITION {
            reader.seek_to_first_event();
        } else {
            reader.seek(last_processed_position + 1);
        }

        info!(
            partition_id,
            replayed,
            last_processed_position,
            open_distributions = state.distribution.open_distributions(),
            "Recovered partition state"
        );

        Ok(Self {
            partition_id,
            partition_count,
            writer,
            reader,
            state,
            registry,
            transport,
            redistributor: CommandRedistributor::new(partition_id, &distribution),
            clock,
            last_processed_position,
            responses: ResponseStore::default(),
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn last_processed_position(&self) -> i64 {
        self.last_processed_position
    }

    pub fn responses(&self) -> ResponseStore {
        self.responses.clone()
    }

    /// Process the next unprocessed command. Returns `false` once nothing
    /// committed is left to read.
    pub fn process_next(&mut self) -> Result<bool, EngineError> {
        let Some(entry) = self.reader.next() else {
            return Ok(false);
        };
        let entry = entry?;
        if !entry.is_command() || entry.position <= self.last_processed_position {
            return Ok(true);
        }
        self.process_command(&entry)?;
        Ok(true)
    }

    /// Process every committed command. Returns how many entries were read.
    pub fn process_all(&mut self) -> Result<usize, EngineError> {
        let mut read = 0;
        while self.process_next()? {
            read += 1;
        }
        Ok(read)
    }

    #[tracing::instrument(
        name = "engine.process",
        skip_all,
        fields(partition_id = self.partition_id, position = command.position, intent = %command.intent)
    )]
    fn process_command(&mut self, command: &LogEntry) -> Result<(), EngineError> {
        let processor = self
            .registry
            .get(command.value_type, command.intent)
            .cloned();
        self.state.checkpoint();

        let (result, output) = {
            let mut ctx = ProcessingContext::new(
                self.partition_id,
                self.partition_count,
                &mut self.state,
                command,
            );
            let result = match &processor {
                Some(processor) => processor.process(&mut ctx, command),
                None => Err(ProcessingError::rejected(
                    RejectionType::InvalidArgument,
                    format!(
                        "Expected a processor for {} {}, but none is registered",
                        command.value_type, command.intent
                    ),
                )),
            };
            (result, ctx.finish())
        };

        let output = match result {
            Ok(()) => return self.write_output(command, output),
            Err(ProcessingError::Expected(rejection)) => {
                debug!(
                    rejection_type = ?rejection.rejection_type,
                    reason = %rejection.reason,
                    "Command rejected"
                );
                self.state.restore_checkpoint();
                self.rejection_output(command, rejection)
            }
            Err(ProcessingError::Unexpected(reason)) => {
                error!(reason = %reason, "Unexpected error processing command");
                self.state.restore_checkpoint();
                self.rejection_output(
                    command,
                    RecordRejection::new(RejectionType::ProcessingError, reason),
                )
            }
        };

        self.write_rejection(command, output)
    }

    fn rejection_output(&mut self, command: &LogEntry, rejection: RecordRejection) -> ProcessingOutput {
        let mut ctx = ProcessingContext::new(
            self.partition_id,
            self.partition_count,
            &mut self.state,
            command,
        );
        ctx.append_rejection(rejection.clone());
        ctx.respond_rejection(rejection);
        ctx.finish()
    }

    fn write_rejection(&mut self, command: &LogEntry, output: ProcessingOutput) -> Result<(), EngineError> {
        self.writer
            .try_write(WriteContext::ProcessingResult, &output.records, command.position)?;
        self.finish_command(command, output.response);
        Ok(())
    }

    fn write_output(
        &mut self,
        command: &LogEntry,
        output: ProcessingOutput,
    ) -> Result<(), EngineError> {
        let ProcessingOutput {
            records,
            sends,
            response,
        } = output;

        if !records.is_empty() {
            match self
                .writer
                .try_write(WriteContext::ProcessingResult, &records, command.position)
            {
                Ok(position) => trace!(position, records = records.len(), "Wrote processing result"),
                Err(WriteFailure::InvalidArgument(reason)) => {
                    // Result batch too large: reject the command instead.
                    error!(reason = %reason, "Processing result cannot be written");
                    self.state.restore_checkpoint();
                    let rejection = RecordRejection::new(RejectionType::ProcessingError, reason);
                    let output = self.rejection_output(command, rejection);
                    return self.write_rejection(command, output);
                }
                Err(e) => {
                    self.state.restore_checkpoint();
                    return Err(e.into());
                }
            }
        }
        self.state.release_checkpoint();

        let now = self.clock.now_millis();
        for (receiver, message) in sends {
            if let InterPartitionMessage::Distribute {
                distribution_key, ..
            } = &message
            {
                self.redistributor
                    .record_send(*distribution_key, receiver, now);
                #[cfg(feature = "otel")]
                DISTRIBUTION_SENT_TOTAL.add(1, &[partition_attr(self.partition_id)]);
            }
            self.send(receiver, &message);
        }
        self.finish_command(command, response);
        Ok(())
    }

    fn finish_command(&mut self, command: &LogEntry, response: Option<CommandResponse>) {
        self.last_processed_position = command.position;
        if let Some(response) = response {
            self.responses.insert(command.position, response);
        }
    }

    fn send(&self, receiver: PartitionId, message: &InterPartitionMessage) {
        if let Err(e) = self.transport.send(receiver, message) {
            // Distribution recovers through redelivery.
            warn!(
                partition_id = self.partition_id,
                receiver,
                kind = message.kind(),
                error = %e,
                "Failed to send inter-partition message"
            );
        }
    }

    /// Write a message from another partition to the log as a command.
    pub fn handle_inbound(&self, message: InterPartitionMessage) -> Result<Option<i64>, EngineError> {
        let entry = match message {
            InterPartitionMessage::Distribute {
                distribution_key,
                value_type,
                intent,
                payload,
                origin_partition,
                ..
            } => LogAppendEntry {
                key: distribution_key,
                record_type: RecordType::Command,
                value_type,
                intent,
                metadata: RecordMetadata {
                    rejection: None,
                    distribution: Some(DistributionMetadata { origin_partition }),
                },
                payload: serde_json::to_vec(&payload)
                    .map_err(crate::record::RecordError::from)?
                    .into(),
            },
            InterPartitionMessage::Acknowledge {
                distribution_key,
                target_partition,
            } => LogAppendEntry::command(
                distribution_key,
                CommandDistributionIntent::Acknowledge,
                &CommandDistributionRecord {
                    partition_id: target_partition,
                    ..Default::default()
                },
            )?,
        };

        match self
            .writer
            .try_write(WriteContext::InterPartition, &[entry], NO_POSITION)
        {
            Ok(position) => Ok(Some(position)),
            Err(WriteFailure::Rejected(rejection)) => {
                // The sender redelivers.
                debug!(
                    partition_id = self.partition_id,
                    reason = %rejection,
                    "Inter-partition command rejected by flow control"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run timers that are due on the partition clock. Returns how many
    /// messages were re-sent.
    pub fn run_scheduled(&mut self) -> usize {
        let now = self.clock.now_millis();
        if !self.redistributor.is_due(now) {
            return 0;
        }
        let messages = self
            .redistributor
            .run_retry_cycle(&self.state.distribution, now);
        for (receiver, message) in &messages {
            #[cfg(feature = "otel")]
            DISTRIBUTION_RETRY_TOTAL.add(1, &[partition_attr(self.partition_id)]);
            self.send(*receiver, message);
        }
        if !messages.is_empty() {
            debug!(
                partition_id = self.partition_id,
                count = messages.len(),
                "Redistributed pending commands"
            );
        }
        messages.len()
    }

    /// Take the response to the command at `position`.
    pub fn take_response(&self, position: i64) -> Option<CommandResponse> {
        self.responses.take(position)
    }
}
