//! Processor contracts.
//!
//! A command is handled by exactly one processor, looked up by its
//! `(ValueType, Intent)`. Distributed processors see the same command twice
//! in its life: once on the partition that accepted it
//! (`process_new_command`) and once on every target partition
//! (`process_distributed_command`, possibly more than once on redelivery).

use crate::record::{
    LogEntry, RecordError, RecordRejection, RecordValue, RejectionType, TypedRecord,
};

use super::context::ProcessingContext;

/// Outcome of a failed command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessingError {
    /// The command is invalid in the current state. Written as a rejection.
    #[error("Command rejected ({:?}): {}", .0.rejection_type, .0.reason)]
    Expected(RecordRejection),

    /// Something went wrong that the command could not have anticipated.
    #[error("Processing failed: {0}")]
    Unexpected(String),
}

impl ProcessingError {
    pub fn rejected(rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        ProcessingError::Expected(RecordRejection::new(rejection_type, reason))
    }
}

impl From<RecordError> for ProcessingError {
    fn from(e: RecordError) -> Self {
        ProcessingError::Unexpected(e.to_string())
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(e: serde_json::Error) -> Self {
        ProcessingError::Unexpected(e.to_string())
    }
}

pub type ProcessingResult = Result<(), ProcessingError>;

/// Processor of a command that is replicated to other partitions.
pub trait DistributedProcessor: Send + Sync {
    type Value: RecordValue;

    /// Validate against local state, apply, and start distribution.
    fn process_new_command(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &TypedRecord<Self::Value>,
    ) -> ProcessingResult;

    /// Apply a command distributed from another partition, then
    /// acknowledge it. Must tolerate redelivery.
    fn process_distributed_command(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &TypedRecord<Self::Value>,
    ) -> ProcessingResult;
}

/// Processor of a partition-local command.
pub trait CommandProcessor: Send + Sync {
    type Value: RecordValue;

    fn process_command(
        &self,
        ctx: &mut ProcessingContext<'_>,
        command: &TypedRecord<Self::Value>,
    ) -> ProcessingResult;
}

/// Type-erased processor held by the registry.
pub trait RecordProcessor: Send + Sync {
    fn process(&self, ctx: &mut ProcessingContext<'_>, command: &LogEntry) -> ProcessingResult;
}

pub(crate) struct Distributed<P>(pub P);

impl<P: DistributedProcessor> RecordProcessor for Distributed<P> {
    fn process(&self, ctx: &mut ProcessingContext<'_>, command: &LogEntry) -> ProcessingResult {
        let typed = TypedRecord::<P::Value>::from_entry(command)?;
        if typed.is_distributed() {
            self.0.process_distributed_command(ctx, &typed)
        } else {
            self.0.process_new_command(ctx, &typed)
        }
    }
}

pub(crate) struct Local<P>(pub P);

impl<P: CommandProcessor> RecordProcessor for Local<P> {
    fn process(&self, ctx: &mut ProcessingContext<'_>, command: &LogEntry) -> ProcessingResult {
        let typed = TypedRecord::<P::Value>::from_entry(command)?;
        self.0.process_command(ctx, &typed)
    }
}
