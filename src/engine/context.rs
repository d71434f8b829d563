//! Per-command processing context.
//!
//! Processors never write to the log or the network directly. They append
//! follow-up records, responses and messages to the context; the stream
//! processor writes the records as one batch and only sends the messages
//! once that batch is accepted. Events are applied to state as they are
//! appended, so later checks in the same command see them.

use serde::Serialize;
use tracing::warn;

use crate::distribution::behavior::{self, DistributionRequest};
use crate::record::{
    Intent, LogAppendEntry, LogEntry, PartitionId, RecordMetadata, RecordRejection, RecordType,
    RecordValue, TypedRecord, ValueType,
};
use crate::transport::InterPartitionMessage;

use super::processor::ProcessingResult;
use super::state::EngineState;

/// Answer to the client that submitted a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    Event {
        key: i64,
        intent: Intent,
        value: serde_json::Value,
    },
    Rejected(RecordRejection),
}

/// What processing one command produced.
#[derive(Debug, Default)]
pub struct ProcessingOutput {
    pub records: Vec<LogAppendEntry>,
    pub sends: Vec<(PartitionId, InterPartitionMessage)>,
    pub response: Option<CommandResponse>,
}

/// Context handed to a processor for one command.
pub struct ProcessingContext<'a> {
    partition_id: PartitionId,
    partition_count: u32,
    state: &'a mut EngineState,
    command: &'a LogEntry,
    output: ProcessingOutput,
}

impl<'a> ProcessingContext<'a> {
    pub(crate) fn new(
        partition_id: PartitionId,
        partition_count: u32,
        state: &'a mut EngineState,
        command: &'a LogEntry,
    ) -> Self {
        Self {
            partition_id,
            partition_count,
            state,
            command,
            output: ProcessingOutput::default(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Every partition except this one.
    pub fn other_partitions(&self) -> Vec<PartitionId> {
        (1..=self.partition_count)
            .filter(|p| *p != self.partition_id)
            .collect()
    }

    pub fn state(&self) -> &EngineState {
        &*self.state
    }

    pub fn next_key(&mut self) -> i64 {
        self.state.next_key()
    }

    /// Append an event and apply it to state.
    pub fn append_event<T: RecordValue>(
        &mut self,
        key: i64,
        intent: impl Into<Intent>,
        value: &T,
    ) -> ProcessingResult {
        let entry = LogAppendEntry::event(key, intent, value)?;
        self.state
            .apply_event(entry.key, entry.value_type, entry.intent, &entry.payload)?;
        self.output.records.push(entry);
        Ok(())
    }

    /// Append a rejection of the current command.
    pub fn append_rejection(&mut self, rejection: RecordRejection) {
        let command = self.command;
        self.output.records.push(LogAppendEntry {
            key: command.key,
            record_type: RecordType::CommandRejection,
            value_type: command.value_type,
            intent: command.intent,
            metadata: RecordMetadata {
                rejection: Some(rejection),
                distribution: command.metadata.distribution,
            },
            payload: command.payload.clone(),
        });
    }

    /// Whether a client is waiting for an answer. Distributed commands and
    /// acknowledgements are written by partitions, not clients.
    fn has_client(&self) -> bool {
        !self.command.is_distributed()
            && self.command.value_type != ValueType::CommandDistribution
    }

    /// Answer the client with an event.
    pub fn respond_event<T: Serialize>(
        &mut self,
        key: i64,
        intent: impl Into<Intent>,
        value: &T,
    ) -> ProcessingResult {
        if !self.has_client() {
            return Ok(());
        }
        self.output.response = Some(CommandResponse::Event {
            key,
            intent: intent.into(),
            value: serde_json::to_value(value)?,
        });
        Ok(())
    }

    pub fn respond_rejection(&mut self, rejection: RecordRejection) {
        if self.has_client() {
            self.output.response = Some(CommandResponse::Rejected(rejection));
        }
    }

    /// Send a message once the command's records are written.
    pub fn send(&mut self, receiver: PartitionId, message: InterPartitionMessage) {
        self.output.sends.push((receiver, message));
    }

    /// Start distributing a command to other partitions.
    pub fn distribution(&mut self) -> DistributionRequest<'_, 'a> {
        DistributionRequest::new(self)
    }

    /// Tell the origin partition that a distributed command was applied.
    pub fn acknowledge_command<T>(&mut self, command: &TypedRecord<T>) {
        match command.metadata.distribution {
            Some(distribution) => behavior::acknowledge_command(
                self,
                command.key,
                distribution.origin_partition,
            ),
            None => warn!(
                key = command.key,
                "Cannot acknowledge a command that was not distributed"
            ),
        }
    }

    pub(crate) fn finish(self) -> ProcessingOutput {
        self.output
    }
}
