//! One partition: log stream, stream processor and inbox.

use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::distribution::DistributionConfig;
use crate::logstream::{
    LogRecordAwaiter, LogStream, LogStreamConfig, LogStreamMetricsSnapshot, WriteContext,
    WriteFailure,
};
use crate::record::{LogAppendEntry, LogEntry, PartitionId, NO_POSITION};
use crate::storage::LogStorage;
use crate::transport::{Inbox, InterPartitionTransport};

use super::context::CommandResponse;
use super::registry::ProcessorRegistry;
use super::state::EngineState;
use super::response::ResponseStore;
use super::stream_processor::{StreamProcessor, StreamProcessorContext};
use super::EngineError;

/// Static settings of a partition.
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    pub partition_id: PartitionId,
    pub partition_count: u32,
    pub log_stream: LogStreamConfig,
    pub distribution: DistributionConfig,
}

/// A running partition, driven by `step`.
pub struct Partition {
    partition_id: PartitionId,
    log_stream: LogStream,
    processor: StreamProcessor,
    inbox: Arc<Inbox>,
}

impl Partition {
    /// Open the log, replay it and get ready to process.
    pub fn open(
        options: &PartitionOptions,
        storage: Arc<dyn LogStorage>,
        transport: Arc<dyn InterPartitionTransport>,
        inbox: Arc<Inbox>,
        clock: Arc<dyn Clock>,
        registry: ProcessorRegistry,
    ) -> Result<Self, EngineError> {
        let partition_id = options.partition_id;
        let log_stream = LogStream::open(
            partition_id,
            storage,
            &options.log_stream,
            Arc::clone(&clock),
        );

        let processor = StreamProcessor::recover(
            StreamProcessorContext {
                partition_id,
                partition_count: options.partition_count,
                writer: log_stream.new_log_stream_writer(),
                registry,
                transport,
                clock,
                distribution: options.distribution.clone(),
            },
            log_stream.new_log_stream_reader()?,
            log_stream.new_log_stream_reader()?,
        )?;

        info!(partition_id, partition_count = options.partition_count, "Partition opened");
        Ok(Self {
            partition_id,
            log_stream,
            processor,
            inbox,
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Write a user command. Returns its position.
    pub fn submit(&self, command: LogAppendEntry) -> Result<i64, WriteFailure> {
        self.log_stream
            .new_log_stream_writer()
            .try_write(WriteContext::UserCommand, &[command], NO_POSITION)
    }

    /// Do all work currently available: write inbound messages, process
    /// committed commands and run due timers. Returns whether anything
    /// happened.
    pub fn step(&mut self) -> Result<bool, EngineError> {
        let inbound = self.inbox.drain();
        let received = inbound.len();
        for message in inbound {
            self.processor.handle_inbound(message)?;
        }

        let processed = self.processor.process_all()?;
        let resent = self.processor.run_scheduled();

        let progressed = received > 0 || processed > 0 || resent > 0;
        if progressed {
            debug!(
                partition_id = self.partition_id,
                received, processed, resent, "Partition step"
            );
        }
        Ok(progressed)
    }

    pub fn take_response(&self, position: i64) -> Option<CommandResponse> {
        self.processor.take_response(position)
    }

    pub fn responses(&self) -> ResponseStore {
        self.processor.responses()
    }

    pub fn state(&self) -> &EngineState {
        self.processor.state()
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    pub fn log_stream(&self) -> &LogStream {
        &self.log_stream
    }

    pub fn register_record_available_listener(&self, awaiter: Arc<dyn LogRecordAwaiter>) {
        self.log_stream.register_record_available_listener(awaiter);
    }

    pub fn metrics(&self) -> LogStreamMetricsSnapshot {
        self.log_stream.metrics()
    }

    /// Every committed record, from the start of the log.
    pub fn records(&self) -> Result<Vec<LogEntry>, EngineError> {
        let reader = self.log_stream.new_log_stream_reader()?;
        reader
            .map(|entry| entry.map_err(EngineError::from))
            .collect()
    }

    pub fn close(&self) {
        self.log_stream.close();
    }
}
