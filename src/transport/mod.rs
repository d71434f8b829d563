//! Inter-partition messaging.
//!
//! Partitions coordinate only through messages: an origin sends DISTRIBUTE
//! to targets, targets send ACKNOWLEDGE back. Delivery is at-most-once;
//! the command distribution protocol redelivers until acknowledged, so a
//! transport may drop messages freely.
//!
//! Messages travel as serde-encoded JSON.

pub mod local;
pub mod lossy;

use serde::{Deserialize, Serialize};

use crate::record::{Intent, PartitionId, ValueType};

pub use local::{Inbox, LocalTransport};
pub use lossy::{LossyConfig, LossyStats, LossyTransport};

/// Errors sending a message.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No partition {0} registered")]
    UnknownPartition(PartitionId),

    #[error("Message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A message between partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterPartitionMessage {
    /// Apply a command distributed by `origin_partition`.
    Distribute {
        distribution_key: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue_id: Option<String>,
        value_type: ValueType,
        intent: Intent,
        payload: serde_json::Value,
        origin_partition: PartitionId,
    },
    /// `target_partition` applied the distributed command.
    Acknowledge {
        distribution_key: i64,
        target_partition: PartitionId,
    },
}

impl InterPartitionMessage {
    pub fn distribution_key(&self) -> i64 {
        match self {
            InterPartitionMessage::Distribute {
                distribution_key, ..
            }
            | InterPartitionMessage::Acknowledge {
                distribution_key, ..
            } => *distribution_key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InterPartitionMessage::Distribute { .. } => "distribute",
            InterPartitionMessage::Acknowledge { .. } => "acknowledge",
        }
    }
}

/// Sends messages to other partitions.
pub trait InterPartitionTransport: Send + Sync {
    fn send(
        &self,
        receiver: PartitionId,
        message: &InterPartitionMessage,
    ) -> Result<(), TransportError>;
}
