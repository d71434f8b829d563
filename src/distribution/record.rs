use serde::{Deserialize, Serialize};

use crate::record::{Intent, PartitionId, RecordValue, ValueType};

/// Value of every `CommandDistribution` record.
///
/// `partition_id` is the target partition for per-target records
/// (ENQUEUED, DISTRIBUTING, ACKNOWLEDGE, ACKNOWLEDGED) and the origin
/// partition for STARTED and FINISHED.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandDistributionRecord {
    pub partition_id: PartitionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_value: Option<serde_json::Value>,
}

impl CommandDistributionRecord {
    /// Same distribution, addressed to another partition.
    pub fn for_partition(&self, partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            ..self.clone()
        }
    }
}

impl RecordValue for CommandDistributionRecord {
    const VALUE_TYPE: ValueType = ValueType::CommandDistribution;
}
