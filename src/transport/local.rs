//! In-process transport.
//!
//! Each partition registers an `Inbox`. Sending encodes the message and
//! pushes it onto the receiver's inbox, waking its runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::record::PartitionId;

use super::{InterPartitionMessage, InterPartitionTransport, TransportError};

/// Encoded messages waiting for one partition.
#[derive(Debug)]
pub struct Inbox {
    partition_id: PartitionId,
    queue: Mutex<VecDeque<Bytes>>,
    notify: Notify,
}

impl Inbox {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub(crate) fn push(&self, message: Bytes) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Take every pending message. Undecodable messages are logged and
    /// skipped.
    pub fn drain(&self) -> Vec<InterPartitionMessage> {
        let raw: Vec<Bytes> = match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return Vec::new(),
        };
        raw.into_iter()
            .filter_map(|bytes| match serde_json::from_slice(&bytes) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(
                        partition_id = self.partition_id,
                        error = %e,
                        "Dropping undecodable inter-partition message"
                    );
                    None
                }
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }

    /// Wait until a message is pushed.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Transport between partitions of one process.
#[derive(Debug, Default)]
pub struct LocalTransport {
    inboxes: RwLock<HashMap<PartitionId, Arc<Inbox>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inbox for `partition_id`, created on first use. A restarted
    /// partition gets its previous inbox back.
    pub fn register(&self, partition_id: PartitionId) -> Arc<Inbox> {
        if let Some(inbox) = self.inbox(partition_id) {
            return inbox;
        }
        let inbox = Arc::new(Inbox::new(partition_id));
        match self.inboxes.write() {
            Ok(mut inboxes) => inboxes.entry(partition_id).or_insert(inbox).clone(),
            Err(_) => inbox,
        }
    }

    pub fn inbox(&self, partition_id: PartitionId) -> Option<Arc<Inbox>> {
        self.inboxes
            .read()
            .ok()
            .and_then(|inboxes| inboxes.get(&partition_id).cloned())
    }
}

impl InterPartitionTransport for LocalTransport {
    fn send(
        &self,
        receiver: PartitionId,
        message: &InterPartitionMessage,
    ) -> Result<(), TransportError> {
        let inbox = self
            .inbox(receiver)
            .ok_or(TransportError::UnknownPartition(receiver))?;
        let bytes = serde_json::to_vec(message)?;
        trace!(
            receiver,
            kind = message.kind(),
            distribution_key = message.distribution_key(),
            "Sending inter-partition message"
        );
        inbox.push(Bytes::from(bytes));
        Ok(())
    }
}
