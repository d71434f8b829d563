//! Async driver for a partition.
//!
//! A tokio task owns the partition and steps it whenever new records are
//! committed, a message arrives in its inbox, or the tick interval fires
//! (for redistribution timers). User commands are written through the
//! shared log writer without going through the task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::logstream::{LogRecordAwaiter, RecordAvailableSignal, Sequencer, WriteContext, WriteFailure};
use crate::record::{LogAppendEntry, PartitionId, NO_POSITION};

use super::context::CommandResponse;
use super::partition::Partition;
use super::response::ResponseStore;

const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Spawns partition tasks.
pub struct PartitionRuntime;

impl PartitionRuntime {
    /// Move `partition` onto a background task.
    pub fn spawn(mut partition: Partition, tick_interval: Duration) -> PartitionHandle {
        let partition_id = partition.partition_id();
        let writer = partition.log_stream().new_log_stream_writer();
        let responses = partition.responses();
        let inbox = Arc::clone(partition.inbox());
        let records = Arc::new(RecordAvailableSignal::new());
        partition.register_record_available_listener(records.clone());
        // Pick up anything committed before the listener was registered.
        records.on_record_available();

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(partition_id, tick_interval = ?tick_interval, "Partition runtime started");
            let mut ticker = tokio::time::interval(tick_interval);

            loop {
                tokio::select! {
                    _ = records.notified() => {}
                    _ = inbox.notified() => {}
                    _ = ticker.tick() => {}
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                }

                if let Err(e) = partition.step() {
                    error!(partition_id, error = %e, "Partition stopped after processing failure");
                    break;
                }
            }

            partition.close();
            info!(partition_id, "Partition runtime stopped");
        });

        PartitionHandle {
            partition_id,
            writer,
            responses,
            cancel: cancel_tx,
            task,
        }
    }
}

/// Handle to a partition running on a background task.
pub struct PartitionHandle {
    partition_id: PartitionId,
    writer: Arc<Sequencer>,
    responses: ResponseStore,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PartitionHandle {
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Write a user command. Returns its position.
    pub fn submit(&self, command: LogAppendEntry) -> Result<i64, WriteFailure> {
        self.writer
            .try_write(WriteContext::UserCommand, &[command], NO_POSITION)
    }

    pub fn take_response(&self, position: i64) -> Option<CommandResponse> {
        self.responses.take(position)
    }

    /// Wait for the response to the command at `position`.
    pub async fn response(&self, position: i64, timeout: Duration) -> Option<CommandResponse> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(response) = self.take_response(position) {
                    return response;
                }
                tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
            }
        })
        .await
        .ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the task and close the partition.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            error!(partition_id = self.partition_id, error = %e, "Partition task failed");
        }
    }
}
