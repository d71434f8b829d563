//! Partition engine.
//!
//! Every partition runs one [`StreamProcessor`] over its log. Processors
//! are looked up in a static [`ProcessorRegistry`] and see a
//! [`ProcessingContext`] through which all side effects flow.

pub mod context;
pub mod partition;
pub mod processor;
pub mod registry;
pub mod response;
pub mod runtime;
pub mod state;
pub mod stream_processor;

use crate::logstream::{LogStreamError, WriteFailure};
use crate::record::RecordError;

pub use context::{CommandResponse, ProcessingContext, ProcessingOutput};
pub use partition::{Partition, PartitionOptions};
pub use processor::{
    CommandProcessor, DistributedProcessor, ProcessingError, ProcessingResult, RecordProcessor,
};
pub use registry::ProcessorRegistry;
pub use response::{ResponseStore, DEFAULT_RESPONSE_CAPACITY};
pub use runtime::{PartitionHandle, PartitionRuntime};
pub use state::{EngineState, KeyGenerator};
pub use stream_processor::{StreamProcessor, StreamProcessorContext};

/// Errors that stop a partition from making progress.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Log stream error: {0}")]
    LogStream(#[from] LogStreamError),

    #[error("Log write failed: {0}")]
    Write(#[from] WriteFailure),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),
}
